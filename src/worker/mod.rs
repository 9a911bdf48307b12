//! Everything a node does on its own behalf, on every node.
//!
//! - [`JobProcessor`]: runs jobs under a concurrency bound and applies the
//!   retry policy
//! - [`handler`]: the [`JobHandler`] trait and the type-to-handler registry
//! - [`HeartbeatPublisher`]: liveness record, membership, peer sync and inbox
//!   draining on a fixed interval
//! - [`JobJanitor`]: times out stuck jobs and purges old finished ones
//!
//! # Job lifecycle on a node
//!
//! 1. The dispatcher reserves a slot and hands the job to
//!    [`JobProcessor::start`], which moves it to `processing`
//! 2. A task per job runs the registered handler
//! 3. Success completes the job; failure requeues it while retries remain,
//!    otherwise fails it
//! 4. Every transition is broadcast as a [`JobEvent`](crate::scheduler::JobEvent)
//!    and mirrored to the store

pub mod handler;
pub mod heartbeat;
pub mod janitor;
pub mod processor;

pub use handler::{handler_fn, FnHandler, HandlerRegistry, JobHandler};
pub use heartbeat::HeartbeatPublisher;
pub use janitor::{JanitorReport, JobJanitor};
pub use processor::JobProcessor;
