//! Mount Daemon
//!
//! Node-local reconciler for ClientMount resources. Watches the ClientMounts
//! addressed to this node and mounts, unmounts and cleans up Lustre and LVM
//! backed file systems to match.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  kube watch ──► Reconciler ──► Mount Orchestrator ──► host   │
//! │                     │                                        │
//! │                     └──► status / finalizer (API server)     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  /healthz /livez /readyz          /metrics                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use kube::{Client, CustomResourceExt};
use prometheus::Registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mount_daemon::controller::standalone;
use mount_daemon::{
    run_controller, ClientMount, CommandExecutorRef, DaemonConfig, Error, HostExecutor,
    KubeStore, MemoryStore, MountOrchestrator, ReconcileMetrics, Reconciler, RecordingExecutor,
    Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Mount Daemon - drives node mounts to match ClientMount resources
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Only watch ClientMounts in this namespace (normally the node name)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Ignore ClientMounts in namespaces starting with this prefix
    #[arg(long, env = "EXCLUDE_NAMESPACE_PREFIX")]
    exclude_namespace_prefix: Option<String>,

    /// Timeout for a single host command, in seconds
    #[arg(long, env = "COMMAND_TIMEOUT_SECS")]
    command_timeout_secs: Option<u64>,

    /// Record host commands instead of running them
    #[arg(long, env = "MOCK")]
    mock: bool,

    /// Delay before retrying a failed pass, in seconds
    #[arg(long, env = "RETRY_DELAY_SECS")]
    retry_delay_secs: Option<u64>,

    /// Cap for exponential retry delays, in seconds
    #[arg(long, env = "RETRY_MAX_DELAY_SECS")]
    retry_max_delay_secs: Option<u64>,

    /// Double the retry delay after each consecutive failure
    #[arg(long, env = "EXPONENTIAL_BACKOFF")]
    exponential_backoff: bool,

    /// YAML configuration file; flags override its values
    #[arg(long, env = "MOUNT_DAEMON_CONFIG")]
    config: Option<PathBuf>,

    /// Reconcile ClientMount manifests from a directory instead of the API server
    #[arg(long, env = "STANDALONE")]
    standalone: Option<PathBuf>,

    /// Print the ClientMount CRD as YAML and exit
    #[arg(long)]
    print_crd: bool,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", serde_yaml::to_string(&ClientMount::crd())?);
        return Ok(());
    }

    // Initialize logging
    init_logging(&args);

    let config = load_config(&args)?;

    info!("Starting Mount Daemon");
    info!("  Version: {}", mount_daemon::VERSION);
    info!(
        "  Namespace: {}",
        config.namespace.as_deref().unwrap_or("all namespaces")
    );
    info!("  Mock mode: {}", config.mock);
    info!("  Retry policy: {:?}", config.retry.policy());
    info!("  Shared file systems: {:?}", config.shared_filesystems);

    let executor: CommandExecutorRef = if config.mock {
        Arc::new(RecordingExecutor::dry_run())
    } else {
        Arc::new(HostExecutor::new(config.command_timeout()))
    };
    let orchestrator = MountOrchestrator::new(executor, config.shared_filesystems.clone());

    let registry = Registry::new();
    let metrics = ReconcileMetrics::new(&registry)?;

    if let Some(dir) = &args.standalone {
        info!("Standalone mode: reconciling manifests from {}", dir.display());
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone(), orchestrator, &config, metrics);

        for resource in standalone::run(&reconciler, &store, dir).await? {
            print!("---\n{}", serde_yaml::to_string(&resource)?);
        }
        return Ok(());
    }

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_registry = registry.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_registry).await {
            error!("Metrics server error: {}", e);
        }
    });

    let client = Client::try_default().await?;
    let store = Arc::new(KubeStore::new(client.clone()));
    let reconciler = Arc::new(Reconciler::new(store, orchestrator, &config, metrics));

    run_controller(client, reconciler, config.namespace.as_deref()).await?;

    info!("Mount daemon shutdown complete");
    Ok(())
}

// =============================================================================
// Configuration
// =============================================================================

fn load_config(args: &Args) -> Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };

    if args.namespace.is_some() {
        config.namespace = args.namespace.clone();
    }
    if args.exclude_namespace_prefix.is_some() {
        config.exclude_namespace_prefix = args.exclude_namespace_prefix.clone();
    }
    if args.command_timeout_secs.is_some() {
        config.command_timeout_secs = args.command_timeout_secs;
    }
    if args.mock {
        config.mock = true;
    }
    if args.exponential_backoff {
        config.retry.exponential = true;
    }
    if let Some(delay) = args.retry_delay_secs {
        config.retry.delay_secs = delay;
    }
    if let Some(max_delay) = args.retry_max_delay_secs {
        config.retry.max_delay_secs = max_delay;
    }

    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, "ok"),
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, registry: Registry) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            match encoder.encode(&registry.gather(), &mut buffer) {
                                Ok(()) => {
                                    let mut response = respond(StatusCode::OK, buffer);
                                    if let Ok(value) = encoder.format_type().parse() {
                                        response
                                            .headers_mut()
                                            .insert(hyper::header::CONTENT_TYPE, value);
                                    }
                                    response
                                }
                                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                            }
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
