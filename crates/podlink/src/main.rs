use clap::{Args, Parser, Subcommand, ValueEnum};
use podlink_controller::{
    ClusterCache, ControllerConfig, DriftReconciler, KubeClient, LabelIndex,
    LabelTagSynchronizer, MockVncApi, PodEventProcessor, PodLocks, ResourceReconciler, VmStore,
    VncApi, VncClient,
};
use podlink_core::{FqName, PodEvent, VirtualNetwork};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "podlink", about = "Pod-to-SDN reconciliation controller")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "PODLINK_LOG_FORMAT", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch pods and keep the SDN resource graph in step
    Run(Opts),
    /// Run a single drift pass and print what it found
    Drift(Opts),
}

#[derive(Args, Clone)]
struct Opts {
    /// Cluster name stamped on every object
    #[arg(long, default_value = "k8s", env = "PODLINK_CLUSTER_NAME")]
    cluster_name: String,
    /// Orchestrator API base URL
    #[arg(long, default_value = "http://127.0.0.1:8001", env = "PODLINK_KUBE_URL")]
    kube_url: String,
    /// Bearer token for the orchestrator API
    #[arg(long, env = "PODLINK_KUBE_TOKEN")]
    kube_token: Option<String>,
    /// SDN API base URL
    #[arg(long, default_value = "http://127.0.0.1:8082", env = "PODLINK_VNC_URL")]
    vnc_url: String,
    /// Auth token for the SDN API
    #[arg(long, env = "PODLINK_VNC_TOKEN")]
    vnc_token: Option<String>,
    /// Use an in-memory SDN API instead of --vnc-url
    #[arg(long, env = "PODLINK_MOCK_VNC")]
    mock_vnc: bool,
    /// Shared project for all namespaces
    #[arg(long, env = "PODLINK_CLUSTER_PROJECT")]
    cluster_project: Option<String>,
    /// Pods run inside VMs with their own SDN port
    #[arg(long, env = "PODLINK_NESTED_MODE")]
    nested_mode: bool,
    /// Draw pod addresses from the IP-fabric IPAM by default
    #[arg(long, env = "PODLINK_IP_FABRIC_FORWARDING")]
    ip_fabric_forwarding: bool,
    /// Seconds between drift passes
    #[arg(long, default_value_t = 60, env = "PODLINK_DRIFT_INTERVAL_SECS")]
    drift_interval_secs: u64,
    /// Deadline in seconds for each API request
    #[arg(long, default_value_t = 10, env = "PODLINK_REQUEST_TIMEOUT_SECS")]
    request_timeout_secs: u64,
    /// Seconds between namespace, virtual-router and pod refreshes
    #[arg(long, default_value_t = 30, env = "PODLINK_REFRESH_INTERVAL_SECS")]
    refresh_interval_secs: u64,
}

impl Opts {
    fn controller_config(&self) -> miette::Result<ControllerConfig> {
        let mut config = ControllerConfig::new(&self.cluster_name);
        config.cluster_project = self.cluster_project.clone();
        config.nested_mode = self.nested_mode;
        config.ip_fabric_forwarding = self.ip_fabric_forwarding;
        config.drift_interval = Duration::from_secs(self.drift_interval_secs);
        config.request_timeout = Duration::from_secs(self.request_timeout_secs);
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    match cli.command {
        Commands::Run(opts) => run(opts).await,
        Commands::Drift(opts) => drift_once(opts).await,
    }
}

/// Everything the tasks share
struct Controller {
    config: Arc<ControllerConfig>,
    api: Arc<dyn VncApi>,
    kube: Arc<KubeClient>,
    cache: Arc<ClusterCache>,
    reconciler: Arc<ResourceReconciler>,
    locks: Arc<PodLocks>,
}

async fn build(opts: &Opts) -> miette::Result<Controller> {
    let config = Arc::new(opts.controller_config()?);

    let api: Arc<dyn VncApi> = if opts.mock_vnc {
        info!("Using in-memory SDN API");
        let mock = MockVncApi::new();
        seed_mock(&mock, &config).await;
        Arc::new(mock)
    } else {
        let client = VncClient::new(&opts.vnc_url, config.request_timeout)?;
        Arc::new(match &opts.vnc_token {
            Some(token) => client.with_auth_token(token),
            None => client,
        })
    };

    let kube = KubeClient::new(&opts.kube_url, config.request_timeout);
    let kube = Arc::new(match &opts.kube_token {
        Some(token) => kube.with_token(token),
        None => kube,
    });

    let cache = Arc::new(ClusterCache::new());
    refresh_mirror(&kube, api.as_ref(), &cache, &config).await?;

    let store = Arc::new(VmStore::new());
    let labels = Arc::new(LabelTagSynchronizer::new(
        api.clone(),
        store.clone(),
        Arc::new(LabelIndex::new()),
    ));
    let reconciler = Arc::new(ResourceReconciler::new(
        api.clone(),
        store,
        cache.clone(),
        config.clone(),
        labels,
    ));
    reconciler.sync_from_remote().await?;

    Ok(Controller {
        config,
        api,
        kube,
        cache,
        reconciler,
        locks: Arc::new(PodLocks::new()),
    })
}

/// The in-memory SDN API starts with the cluster's default networks
async fn seed_mock(mock: &MockVncApi, config: &ControllerConfig) {
    for fq_name in [&config.default_pod_network, &config.default_network] {
        mock.add_network(VirtualNetwork {
            uuid: fq_name.name().to_string(),
            fq_name: FqName::clone(fq_name),
            ..Default::default()
        })
        .await;
    }
}

async fn refresh_mirror(
    kube: &KubeClient,
    api: &dyn VncApi,
    cache: &ClusterCache,
    config: &ControllerConfig,
) -> miette::Result<()> {
    cache.replace_namespaces(kube.list_namespaces(config).await?);
    cache.replace_virtual_routers(api.virtual_router_list().await?);
    kube.resync_pods(cache).await?;
    Ok(())
}

async fn run(opts: Opts) -> miette::Result<()> {
    let controller = build(&opts).await?;
    let token = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<PodEvent>(1024);

    info!(
        "Starting podlink for cluster {} (nested: {})",
        controller.config.cluster_name, controller.config.nested_mode
    );

    // Event processor
    let processor = PodEventProcessor::new(controller.reconciler.clone(), controller.locks.clone());
    let processor_token = token.clone();
    let processor_handle = tokio::spawn(async move {
        if let Err(e) = processor.run(rx, processor_token).await {
            error!("Pod event processor error: {}", e);
        }
    });

    // Drift reconciler
    let drift = DriftReconciler::new(
        controller.reconciler.clone(),
        controller.cache.clone(),
        controller.locks.clone(),
        tx.clone(),
    );
    let drift_token = token.clone();
    let drift_handle = tokio::spawn(async move {
        if let Err(e) = drift.run(drift_token).await {
            error!("Drift reconciler error: {}", e);
        }
    });

    // Pod watch, reconnecting until shutdown
    let kube = controller.kube.clone();
    let cache = controller.cache.clone();
    let watch_token = token.clone();
    let watch_handle = tokio::spawn(async move {
        while !watch_token.is_cancelled() {
            if let Err(e) = kube.watch_pods(&cache, &tx, watch_token.clone()).await {
                warn!("Pod watch failed: {}", e);
            }
            tokio::select! {
                _ = watch_token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
            }
        }
    });

    // Namespace, virtual-router and pod refresh
    let refresh_every = Duration::from_secs(opts.refresh_interval_secs.max(1));
    let (kube, api, cache, config) = (
        controller.kube.clone(),
        controller.api.clone(),
        controller.cache.clone(),
        controller.config.clone(),
    );
    let refresh_token = token.clone();
    let refresh_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(refresh_every);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = refresh_token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = refresh_mirror(&kube, api.as_ref(), &cache, &config).await {
                        warn!("Mirror refresh failed: {}", e);
                    }
                }
            }
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    // Wait for all tasks to finish with a timeout
    let shutdown_timeout = Duration::from_secs(5);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = tokio::join!(processor_handle, drift_handle, watch_handle, refresh_handle);
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn drift_once(opts: Opts) -> miette::Result<()> {
    let controller = build(&opts).await?;
    let (tx, mut rx) = mpsc::channel::<PodEvent>(1024);

    let drift = DriftReconciler::new(
        controller.reconciler.clone(),
        controller.cache.clone(),
        controller.locks.clone(),
        tx,
    );
    // Drain while the pass runs; the pass blocks once the channel is full
    let printer = async move {
        while let Some(event) = rx.recv().await {
            println!("orphan: {}", event.uid().unwrap_or("-"));
        }
    };
    let pass = async move {
        let report = drift.run_once().await;
        drop(drift);
        report
    };
    let (report, ()) = tokio::join!(pass, printer);
    let report = report?;

    println!(
        "{} orphaned VMs, {} VMs attached to their virtual router",
        report.orphans.len(),
        report.reattached
    );
    Ok(())
}
