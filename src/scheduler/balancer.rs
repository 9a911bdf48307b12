use std::cmp::Reverse;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::cluster::registry::{NodeDescriptor, NodeStatus};
use crate::error::MeshError;

/// How the leader picks a node for a queued job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Cycle through eligible nodes.
    RoundRobin,
    /// Fewest active jobs wins.
    #[default]
    LeastLoaded,
    /// Random pick weighted by node priority.
    WeightedRandom,
    /// Highest priority among nodes advertising the type.
    CapabilityBased,
}

impl std::fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalancingStrategy::RoundRobin => write!(f, "round_robin"),
            LoadBalancingStrategy::LeastLoaded => write!(f, "least_loaded"),
            LoadBalancingStrategy::WeightedRandom => write!(f, "weighted_random"),
            LoadBalancingStrategy::CapabilityBased => write!(f, "capability_based"),
        }
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(LoadBalancingStrategy::RoundRobin),
            "least_loaded" => Ok(LoadBalancingStrategy::LeastLoaded),
            "weighted_random" => Ok(LoadBalancingStrategy::WeightedRandom),
            "capability_based" => Ok(LoadBalancingStrategy::CapabilityBased),
            other => Err(MeshError::InvalidConfig(format!(
                "unknown load balancing strategy {other:?}"
            ))),
        }
    }
}

/// Active and advertising `job_type`, in input order.
pub fn eligible_nodes<'a, I>(nodes: I, job_type: &str) -> Vec<&'a NodeDescriptor>
where
    I: IntoIterator<Item = &'a NodeDescriptor>,
{
    nodes
        .into_iter()
        .filter(|n| n.status == NodeStatus::Active && n.capabilities.supports(job_type))
        .collect()
}

/// Picks target nodes with one process-wide strategy.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    round_robin_counter: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            round_robin_counter: AtomicUsize::new(0),
        }
    }

    /// Choose a node for a job of `job_type`.
    ///
    /// Ineligible nodes are filtered out first. A `routing_key` then picks,
    /// by hash, among the nodes the strategy rates best, so the same key lands
    /// on the same node while that set is unchanged.
    pub fn select<'a>(
        &self,
        nodes: &[&'a NodeDescriptor],
        job_type: &str,
        routing_key: Option<&str>,
    ) -> Option<&'a NodeDescriptor> {
        self.select_with_rng(nodes, job_type, routing_key, &mut rand::thread_rng())
    }

    pub fn select_with_rng<'a, R: Rng + ?Sized>(
        &self,
        nodes: &[&'a NodeDescriptor],
        job_type: &str,
        routing_key: Option<&str>,
        rng: &mut R,
    ) -> Option<&'a NodeDescriptor> {
        let eligible = eligible_nodes(nodes.iter().copied(), job_type);
        if eligible.is_empty() {
            return None;
        }

        if let Some(key) = routing_key {
            let candidates = self.best_candidates(eligible);
            let idx = (fnv1a(key) % candidates.len() as u64) as usize;
            return candidates.get(idx).copied();
        }

        match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let idx = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
                eligible.get(idx).copied()
            }
            LoadBalancingStrategy::LeastLoaded => {
                eligible.into_iter().min_by_key(|n| n.current_load)
            }
            LoadBalancingStrategy::WeightedRandom => {
                let weights: Vec<u64> = eligible
                    .iter()
                    .map(|n| n.capabilities.priority.max(0) as u64)
                    .collect();
                let idx = match WeightedIndex::new(&weights) {
                    Ok(dist) => dist.sample(rng),
                    // every weight is zero
                    Err(_) => rng.gen_range(0..eligible.len()),
                };
                eligible.get(idx).copied()
            }
            // min_by_key keeps the first of equal keys, so ties go to iteration order
            LoadBalancingStrategy::CapabilityBased => eligible
                .into_iter()
                .min_by_key(|n| Reverse(n.capabilities.priority)),
        }
    }

    /// Eligible nodes the strategy cannot tell apart. Never empty when
    /// `eligible` is not.
    fn best_candidates<'a>(&self, eligible: Vec<&'a NodeDescriptor>) -> Vec<&'a NodeDescriptor> {
        match self.strategy {
            LoadBalancingStrategy::RoundRobin => eligible,
            LoadBalancingStrategy::LeastLoaded => {
                let least = eligible.iter().map(|n| n.current_load).min();
                eligible
                    .into_iter()
                    .filter(|n| Some(n.current_load) == least)
                    .collect()
            }
            LoadBalancingStrategy::WeightedRandom => {
                let weighted: Vec<&NodeDescriptor> = eligible
                    .iter()
                    .copied()
                    .filter(|n| n.capabilities.priority > 0)
                    .collect();
                if weighted.is_empty() {
                    eligible
                } else {
                    weighted
                }
            }
            LoadBalancingStrategy::CapabilityBased => {
                let top = eligible.iter().map(|n| n.capabilities.priority).max();
                eligible
                    .into_iter()
                    .filter(|n| Some(n.capabilities.priority) == top)
                    .collect()
            }
        }
    }
}

fn fnv1a(key: &str) -> u64 {
    key.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x0100_0000_01b3)
    })
}
