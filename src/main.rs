use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::ResourceExt;
use pair_scheduler::controller::labels::{DEFAULT_PLACEHOLDER_IMAGE, DEFAULT_PLACEHOLDER_NAMESPACE};
use pair_scheduler::controller::pair_record::{record_owner, record_pair_label};
use pair_scheduler::controller::placeholder::is_deployment_ready;
use pair_scheduler::controller::{self, ClusterApi, KubeClusterApi, LoopContexts, Placeholder};
use pair_scheduler::leader_election::LeaderElector;
use pair_scheduler::{telemetry, Error};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler, warm-pool and reaper loops
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show tenants, pair records and the warm pool
    Info(InfoArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace holding placeholder deployments and pair records
    #[arg(long, env = "PLACEHOLDER_NAMESPACE", default_value = DEFAULT_PLACEHOLDER_NAMESPACE)]
    placeholder_namespace: String,

    /// Image run by placeholder pods
    #[arg(long, env = "PLACEHOLDER_IMAGE", default_value = DEFAULT_PLACEHOLDER_IMAGE)]
    placeholder_image: String,

    /// Port for health probes, metrics and the REST API
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    metrics_port: u16,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Log every write instead of performing it
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,

    /// Namespace of the leader-election lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    lease_namespace: String,

    /// Holder identity for the lease; defaults to the hostname
    #[arg(long, env = "LEADER_ELECTION_ID")]
    identity: Option<String>,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace holding placeholder deployments and pair records
    #[arg(long, env = "PLACEHOLDER_NAMESPACE", default_value = DEFAULT_PLACEHOLDER_NAMESPACE)]
    placeholder_namespace: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("pair-scheduler v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default().await.map_err(Error::KubeError)?;
    let api = KubeClusterApi::new(client, args.placeholder_namespace, true);

    let tenants = api.list_tenants().await?;
    let dedicated: Vec<_> = tenants
        .iter()
        .filter(|t| t.is_dedicated_request_serving())
        .collect();
    println!("Dedicated hosted clusters: {}", dedicated.len());
    for tenant in dedicated {
        println!(
            "  {}/{} size={}",
            tenant.namespace().unwrap_or_default(),
            tenant.name_any(),
            tenant.desired_size().unwrap_or("-")
        );
    }

    let records = api.list_records().await?;
    println!("Pair records: {}", records.len());
    for record in &records {
        println!("  {} -> {}", record_pair_label(record), record_owner(record));
    }

    let placeholders = api.list_placeholders().await?;
    println!("Placeholders: {}", placeholders.len());
    for deployment in &placeholders {
        let flavor = match Placeholder::classify(deployment) {
            Placeholder::WarmPool { size, index } => format!("warm-pool size={size} index={index}"),
            Placeholder::TenantOwned { namespace, name } => format!("tenant {namespace}/{name}"),
            Placeholder::Unrecognized { .. } => "unrecognized".to_string(),
        };
        println!(
            "  {} {} ready={}",
            deployment.name_any(),
            flavor,
            is_deployment_ready(deployment)
        );
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<(), Error> {
    telemetry::init_telemetry(args.log_json)?;

    info!("Starting pair-scheduler v{}", env!("CARGO_PKG_VERSION"));
    if args.dry_run {
        warn!("Dry-run mode: writes are logged and skipped");
    }

    let client = kube::Client::try_default().await.map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let api = KubeClusterApi::new(client.clone(), args.placeholder_namespace.clone(), args.dry_run);
    api.ensure_namespace().await?;

    let holder_identity = args.identity.clone().unwrap_or_else(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    });
    info!("Leader election using holder ID: {}", holder_identity);

    let is_leader = Arc::new(AtomicBool::new(false));
    let elector = LeaderElector::new(
        client.clone(),
        &args.lease_namespace,
        &holder_identity,
        Arc::clone(&is_leader),
    );
    tokio::spawn(elector.run());

    let contexts = LoopContexts::new(Arc::new(api), &args.placeholder_image, is_leader);

    #[cfg(feature = "rest-api")]
    {
        let api_state = contexts.scheduler.clone();
        let port = args.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = pair_scheduler::rest_api::run_server(api_state, port).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    let result = controller::run_controllers(client, &args.placeholder_namespace, contexts).await;

    telemetry::shutdown_telemetry();

    result
}
