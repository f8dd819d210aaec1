use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use elastic_lite::bootstrap::JobScheduler;
use elastic_lite::config::{CoordinatorConfig, EtcdConfig, JobConfig};
use elastic_lite::executor::ScriptJobExecutor;
use elastic_lite::job_registry::JobRegistry;
use elastic_lite::registry::{EtcdRegistryCenter, MemoryRegistryServer, RegistryCenter};
use elastic_lite::shutdown::install_shutdown_handler;
use elastic_lite::storage::{path, ConfigurationService, JobNodeStorage};
use elastic_lite::topology::{ServerService, ServerStatus};

#[derive(Parser, Debug)]
#[command(name = "elastic-lite")]
#[command(version)]
#[command(about = "Distributed shard coordination for scheduled jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a job instance on this host until interrupted
    Run(RunArgs),

    /// Show configuration, topology and assignment of a job
    Status {
        #[command(flatten)]
        registry: RegistryArgs,

        /// Job name
        #[arg(long)]
        job: String,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Enable or disable a host for a job
    Server {
        #[command(flatten)]
        registry: RegistryArgs,

        #[command(subcommand)]
        command: ServerCommands,
    },

    /// Ask every online instance of a job to run once
    Trigger {
        #[command(flatten)]
        registry: RegistryArgs,

        /// Job name
        #[arg(long)]
        job: String,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RegistryArgs {
    /// Etcd endpoints (comma-separated); defaults to ETCD_ENDPOINTS
    #[arg(long, env = "ETCD_ENDPOINTS", value_delimiter = ',')]
    etcd: Vec<String>,

    /// Key namespace in etcd; defaults to ELASTIC_NAMESPACE
    #[arg(long, env = "ELASTIC_NAMESPACE")]
    namespace: Option<String>,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    registry: RegistryArgs,

    /// Use an in-process registry instead of etcd (single host only)
    #[arg(long)]
    standalone: bool,

    /// Job name
    #[arg(long)]
    job: String,

    /// Cron expression with seconds, e.g. "0/5 * * * * ?"
    #[arg(long)]
    cron: String,

    /// Number of sharding items
    #[arg(long, visible_alias = "total", default_value = "1")]
    sharding_total_count: u32,

    /// Per-item parameters, e.g. "0=Beijing,1=Shanghai"
    #[arg(long, default_value = "")]
    item_parameters: String,

    /// Parameter passed to every item
    #[arg(long, default_value = "")]
    job_parameter: String,

    /// Shell command run for each item; receives the item context as JSON
    #[arg(long)]
    script: String,

    /// Sharding strategy (AVG_ALLOCATION, ODEVITY, ROUND_ROBIN)
    #[arg(long, default_value = "AVG_ALLOCATION")]
    strategy: String,

    /// Take over items of crashed instances
    #[arg(long)]
    failover: bool,

    /// Keep the first assignment forever
    #[arg(long)]
    static_sharding: bool,

    /// Minutes between reconcile checks, 0 disables
    #[arg(long, default_value = "10")]
    reconcile_interval_minutes: u32,

    /// Start with this host disabled
    #[arg(long)]
    disabled: bool,

    /// Replace the published configuration with this one
    #[arg(long)]
    overwrite: bool,

    /// Address published for this host; detected when omitted
    #[arg(long)]
    host_ip: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum ServerCommands {
    /// Allow the host to take items again
    Enable(ServerArgs),
    /// Withdraw the host from sharding and leadership
    Disable(ServerArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Job name
    #[arg(long)]
    job: String,

    /// Host address as published under servers/
    #[arg(long)]
    ip: String,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ServerOutput {
    ip: String,
    status: String,
}

#[derive(Serialize)]
struct ItemOutput {
    item: u32,
    instance: Option<String>,
    running: bool,
    failover: Option<String>,
    disabled: bool,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_name: String,
    cron: String,
    sharding_total_count: u32,
    strategy: String,
    leader: Option<String>,
    resharding_pending: bool,
    servers: Vec<ServerOutput>,
    instances: Vec<String>,
    items: Vec<ItemOutput>,
    failover_queue: Vec<String>,
}

// =============================================================================
// Helpers
// =============================================================================

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn connect_etcd(args: &RegistryArgs) -> Result<Arc<dyn RegistryCenter>, Box<dyn std::error::Error>> {
    let mut config = EtcdConfig::from_env();
    if !args.etcd.is_empty() {
        config.endpoints = args.etcd.clone();
    }
    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    tracing::info!(endpoints = ?config.endpoints, namespace = %config.namespace, "Connecting to etcd");
    let registry: Arc<dyn RegistryCenter> = EtcdRegistryCenter::connect(config).await?;
    Ok(registry)
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_job(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let registry: Arc<dyn RegistryCenter> = if args.standalone {
        tracing::warn!("Running standalone; other hosts cannot join this job");
        MemoryRegistryServer::new().connect()
    } else {
        connect_etcd(&args.registry).await?
    };

    let config = JobConfig::new(&args.job, &args.cron, args.sharding_total_count)
        .with_sharding_item_parameters(args.item_parameters)
        .with_job_parameter(args.job_parameter)
        .with_strategy(args.strategy)
        .with_failover(args.failover)
        .with_static_sharding(args.static_sharding)
        .with_reconcile_interval_minutes(args.reconcile_interval_minutes)
        .with_disabled(args.disabled)
        .with_overwrite(args.overwrite);

    let mut coordinator = CoordinatorConfig::default();
    if let Some(ip) = args.host_ip {
        coordinator = coordinator.with_host_ip(ip);
    }

    tracing::info!(
        job = %config.job_name,
        cron = %config.cron,
        total = config.sharding_total_count,
        script = %args.script,
        "Starting elastic-lite job"
    );

    let shutdown = install_shutdown_handler();
    let scheduler = JobScheduler::builder(registry.clone(), config, Arc::new(ScriptJobExecutor::new(args.script)))
        .with_job_registry(JobRegistry::new())
        .with_coordinator(coordinator)
        .start()
        .await?;
    tracing::info!(instance = %scheduler.instance(), "Job instance running");

    shutdown.cancelled().await;
    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = %e, "Job shutdown incomplete");
    }
    registry.close().await?;
    Ok(())
}

async fn handle_status(
    registry: Arc<dyn RegistryCenter>,
    job: &str,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let storage = JobNodeStorage::new(registry, job);
    let config = ConfigurationService::new(storage.clone()).load().await?;

    let mut servers = Vec::new();
    for ip in storage.get_job_node_children_keys(path::SERVERS).await? {
        let data = storage
            .get_job_node_data(&path::server_node(&ip))
            .await?
            .unwrap_or_default();
        servers.push(ServerOutput {
            ip,
            status: ServerStatus::from_node_data(&data).to_string(),
        });
    }

    let mut items = Vec::new();
    for item in 0..config.sharding_total_count {
        items.push(ItemOutput {
            item,
            instance: storage.get_job_node_data(&path::sharding_instance_node(item)).await?,
            running: storage.is_job_node_existed(&path::running_node(item)).await?,
            failover: storage.get_job_node_data(&path::failover_claim_node(item)).await?,
            disabled: storage.is_job_node_existed(&path::disabled_node(item)).await?,
        });
    }

    let output = JobStatusOutput {
        job_name: config.job_name.clone(),
        cron: config.cron.clone(),
        sharding_total_count: config.sharding_total_count,
        strategy: config.job_sharding_strategy_type.clone(),
        leader: storage.get_job_node_data(path::LEADER_INSTANCE).await?,
        resharding_pending: storage.is_job_node_existed(path::SHARDING_NECESSARY).await?,
        servers,
        instances: storage.get_job_node_children_keys(path::INSTANCES).await?,
        items,
        failover_queue: storage.get_job_node_children_keys(path::FAILOVER).await?,
    };

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job:      {}", output.job_name);
            println!("Cron:     {}", output.cron);
            println!("Items:    {} ({})", output.sharding_total_count, output.strategy);
            println!("Leader:   {}", output.leader.as_deref().unwrap_or("-"));
            if output.resharding_pending {
                println!("Resharding pending");
            }
            println!();
            println!("{:<20} STATUS", "SERVER");
            println!("{}", "-".repeat(30));
            for server in &output.servers {
                println!("{:<20} {}", server.ip, server.status);
            }
            println!();
            println!("Instances:");
            for instance in &output.instances {
                println!("  {}", instance);
            }
            println!();
            println!("{:<6} {:<32} {:<8} {:<10} FAILOVER", "ITEM", "INSTANCE", "RUNNING", "DISABLED");
            println!("{}", "-".repeat(70));
            for item in &output.items {
                println!(
                    "{:<6} {:<32} {:<8} {:<10} {}",
                    item.item,
                    item.instance.as_deref().unwrap_or("-"),
                    if item.running { "yes" } else { "no" },
                    if item.disabled { "yes" } else { "no" },
                    item.failover.as_deref().unwrap_or("-"),
                );
            }
            if !output.failover_queue.is_empty() {
                println!();
                println!("Queued for failover: {}", output.failover_queue.join(","));
            }
        }
    }
    Ok(())
}

async fn handle_server(
    registry: Arc<dyn RegistryCenter>,
    command: ServerCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let (args, status) = match command {
        ServerCommands::Enable(args) => (args, ServerStatus::Enabled),
        ServerCommands::Disable(args) => (args, ServerStatus::Disabled),
    };
    let storage = JobNodeStorage::new(registry, &args.job);
    let servers = ServerService::new(storage, JobRegistry::new(), &args.ip);
    servers.set_status(&args.ip, status).await?;
    println!("Server {} of job {} is now {}", args.ip, args.job, status);
    Ok(())
}

async fn handle_trigger(registry: Arc<dyn RegistryCenter>, job: &str) -> Result<(), Box<dyn std::error::Error>> {
    let storage = JobNodeStorage::new(registry, job);
    let instances = storage.get_job_node_children_keys(path::INSTANCES).await?;
    for id in &instances {
        storage
            .update_job_node(&path::instance_node(id), elastic_lite::topology::instance::TRIGGER)
            .await?;
    }
    println!("Triggered {} instance(s) of job {}", instances.len(), job);
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Run(run_args) => {
            run_job(run_args).await?;
        }
        Commands::Status {
            registry,
            job,
            output,
        } => {
            let registry = connect_etcd(&registry).await?;
            handle_status(registry.clone(), &job, &output).await?;
            registry.close().await?;
        }
        Commands::Server { registry, command } => {
            let registry = connect_etcd(&registry).await?;
            handle_server(registry.clone(), command).await?;
            registry.close().await?;
        }
        Commands::Trigger { registry, job } => {
            let registry = connect_etcd(&registry).await?;
            handle_trigger(registry.clone(), &job).await?;
            registry.close().await?;
        }
    }

    Ok(())
}
