use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use jobmesh::api::{run_api, ApiState, ErrorResponse, SubmitJobRequest, SubmitJobResponse};
use jobmesh::cluster::ClusterHealth;
use jobmesh::config::{generate_node_id, NodeCapabilities, NodeConfig, DEFAULT_JOB_TYPES};
use jobmesh::scheduler::{DistributedJob, JobPriority, LoadBalancingStrategy};
use jobmesh::shutdown::install_shutdown_handler;
use jobmesh::store::{CoordinationStore, MemoryStore};
use jobmesh::worker::{handler_fn, HandlerRegistry};
use jobmesh::MeshNode;

#[derive(Parser, Debug)]
#[command(name = "jobmesh")]
#[command(version)]
#[command(about = "Distributed job coordination over a shared key-value store")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a jobmesh node
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Cluster management commands
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (generated when unset)
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    /// Advertised host
    #[arg(long, env = "NODE_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port for the HTTP API
    #[arg(long, env = "NODE_PORT", default_value = "8080")]
    port: u16,

    /// Upper bound on jobs processing at once
    #[arg(long, env = "MAX_CONCURRENT_JOBS", default_value = "5")]
    max_concurrent_jobs: usize,

    /// Placement weight; higher wins
    #[arg(long, env = "NODE_PRIORITY", default_value = "1", allow_hyphen_values = true)]
    priority: i32,

    /// Job types this node runs (comma-separated)
    #[arg(long, env = "SUPPORTED_JOB_TYPES", value_delimiter = ',')]
    job_types: Vec<String>,

    /// round_robin, least_loaded, weighted_random or capability_based
    #[arg(long, env = "LOAD_BALANCING_STRATEGY", default_value = "least_loaded")]
    strategy: LoadBalancingStrategy,

    /// Shared store; without it the node runs standalone on an in-memory store
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value = "30000")]
    heartbeat_interval_ms: u64,

    /// Leader election interval in milliseconds
    #[arg(long, default_value = "10000")]
    leader_election_interval_ms: u64,
}

// =============================================================================
// Client Arguments (shared by job and cluster commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Node HTTP address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job to the cluster
    Submit {
        /// Job type, e.g. "ranking_update"
        job_type: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        data: String,

        /// low, normal, high or critical
        #[arg(long)]
        priority: Option<JobPriority>,

        /// Sticky routing key
        #[arg(long)]
        routing_key: Option<String>,

        /// Retry budget
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List jobs held by the node
    List,
}

// =============================================================================
// Cluster Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// Node counts, job counts and load distribution
    Health,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let job_types = if args.job_types.is_empty() {
        DEFAULT_JOB_TYPES.iter().map(|t| t.to_string()).collect()
    } else {
        args.job_types
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    };

    let config = NodeConfig {
        node_id: args.node_id.unwrap_or_else(generate_node_id),
        host: args.host,
        port: args.port,
        capabilities: NodeCapabilities {
            max_concurrent_jobs: args.max_concurrent_jobs,
            supported_job_types: job_types,
            priority: args.priority,
        },
        strategy: args.strategy,
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        leader_election_interval_ms: args.leader_election_interval_ms,
        ..NodeConfig::default()
    };

    let store = connect_store(args.redis_url.as_deref()).await?;

    // Business logic lives with the embedding application; the standalone
    // server acknowledges each job with its payload.
    let mut handlers = HandlerRegistry::new();
    for job_type in &config.capabilities.supported_job_types {
        handlers = handlers.register(
            job_type.clone(),
            handler_fn(|job: DistributedJob| async move {
                tracing::info!(job_id = %job.id, job_type = %job.job_type, "Acknowledged job");
                Ok(serde_json::json!({ "acknowledged": true, "data": job.data }))
            }),
        );
    }

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    let node = Arc::new(MeshNode::new(config, store, handlers)?);
    let token = install_shutdown_handler();

    let api_state = ApiState { node: node.clone() };
    let api_token = token.clone();
    let api = tokio::spawn(async move { run_api(listen_addr, api_state, api_token).await });

    node.run_until(token).await;
    if let Err(e) = api.await {
        tracing::warn!(error = %e, "HTTP API task ended abnormally");
    }
    Ok(())
}

async fn connect_store(
    redis_url: Option<&str>,
) -> Result<Arc<dyn CoordinationStore>, Box<dyn std::error::Error>> {
    match redis_url {
        #[cfg(feature = "redis")]
        Some(url) => Ok(Arc::new(jobmesh::store::RedisStore::connect(url).await?)),
        #[cfg(not(feature = "redis"))]
        Some(_) => Err("REDIS_URL is set but jobmesh was built without the redis feature".into()),
        None => {
            tracing::warn!("No REDIS_URL set, running standalone on an in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn read_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, Box<dyn std::error::Error>> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    Err(format!("request failed ({status}): {message}").into())
}

async fn handle_job_submit(
    http: &reqwest::Client,
    client: &ClientArgs,
    request: SubmitJobRequest,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .post(format!("{}/api/jobs", client.addr))
        .json(&request)
        .send()
        .await?;
    let status = response.status();
    let body: SubmitJobResponse = response.json().await?;

    match (body.job_id, &client.output) {
        (Some(_), OutputFormat::Json) => println!("{}", serde_json::to_string_pretty(&body)?),
        (Some(job_id), OutputFormat::Table) => {
            println!("Job submitted successfully!");
            println!("Job ID: {job_id}");
        }
        (None, _) => {
            eprintln!(
                "Error: Job submission failed ({status}): {}",
                body.error.unwrap_or_default()
            );
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn handle_job_status(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .get(format!("{}/api/jobs/{}", client.addr, job_id))
        .send()
        .await?;
    let job: DistributedJob = read_response(response).await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => {
            println!("Job ID:      {}", job.id);
            println!("Type:        {}", job.job_type);
            println!("Status:      {}", job.status);
            println!("Priority:    {}", job.priority);
            println!(
                "Assigned to: {}",
                job.assigned_node_id.as_deref().unwrap_or("-")
            );
            println!("Retries:     {}/{}", job.retry_count, job.max_retries);
            if let Some(result) = &job.result {
                println!("Result:      {result}");
            }
            if let Some(error) = &job.error {
                println!("Error:       {error}");
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http.get(format!("{}/api/jobs", client.addr)).send().await?;
    let jobs: Vec<DistributedJob> = read_response(response).await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            println!(
                "{:<38} {:<20} {:<12} {:<10} NODE",
                "JOB ID", "TYPE", "STATUS", "PRIORITY"
            );
            for job in &jobs {
                println!(
                    "{:<38} {:<20} {:<12} {:<10} {}",
                    job.id,
                    job.job_type,
                    job.status.to_string(),
                    job.priority.to_string(),
                    job.assigned_node_id.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}

async fn handle_cluster_health(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .get(format!("{}/api/cluster/health", client.addr))
        .send()
        .await?;
    let health: ClusterHealth = read_response(response).await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&health)?),
        OutputFormat::Table => {
            println!(
                "Nodes:    {} total, {} active",
                health.total_nodes, health.active_nodes
            );
            println!(
                "Leader:   {}",
                health.leader_id.as_deref().unwrap_or("none")
            );
            println!(
                "Jobs:     {} total, {} processing, {} completed, {} failed",
                health.total_jobs,
                health.processing_jobs,
                health.completed_jobs,
                health.failed_jobs
            );
            if let Some(ms) = health.average_duration_ms {
                println!("Avg time: {ms} ms");
            }
            println!();
            println!("{:<20} {:<12} {:<10} LOAD", "NODE", "STATUS", "JOBS");
            for node in &health.load_distribution {
                println!(
                    "{:<20} {:<12} {:<10} {:.0}%",
                    node.node_id,
                    node.status.to_string(),
                    format!("{}/{}", node.active_jobs, node.max_concurrent_jobs),
                    node.load_ratio * 100.0
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let http = reqwest::Client::new();

            match command {
                JobCommands::Submit {
                    job_type,
                    data,
                    priority,
                    routing_key,
                    max_retries,
                } => {
                    let data: Value = serde_json::from_str(&data)?;
                    let request = SubmitJobRequest {
                        job_type,
                        data,
                        priority,
                        routing_key,
                        max_retries,
                    };
                    handle_job_submit(&http, &client, request).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&http, &client, job_id).await?;
                }
                JobCommands::List => {
                    handle_job_list(&http, &client).await?;
                }
            }
        }
        Commands::Cluster { client, command } => {
            let http = reqwest::Client::new();

            match command {
                ClusterCommands::Health => {
                    handle_cluster_health(&http, &client).await?;
                }
            }
        }
    }

    Ok(())
}
