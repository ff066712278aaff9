use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use k8s_openapi::api::apps::v1::Deployment;
use ordin_api::ApiState;
use ordin_bus::{connection_info, Bus, RedisBus};
use ordin_pipeline::{Consumer, PipelineConfig, Producer};
use ordin_queue::PipelineStats;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ordinctl", version, about = "Propagate deployment changes over Redis and mirror them")]
struct Cli {
    #[command(flatten)]
    redis: RedisArgs,

    /// Attempts per change before a failing one is dropped
    #[arg(long = "max-retries", env = "ORDIN_MAX_RETRIES", global = true)]
    max_retries: Option<u32>,

    /// Worker tasks draining the dispatch queue
    #[arg(long = "workers", env = "ORDIN_WORKERS", global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct RedisArgs {
    /// Redis host:port (or redis:// URL)
    #[arg(long = "redis-addr", env = "REDIS_ADDR", default_value = "localhost:6379", global = true)]
    addr: String,

    #[arg(long = "redis-username", env = "REDIS_USERNAME", global = true)]
    username: Option<String>,

    #[arg(long = "redis-password", env = "REDIS_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch deployments and publish every change to the bus
    Controller {
        /// Only watch this namespace (default: all)
        #[arg(long = "ns", env = "ORDIN_NAMESPACE")]
        namespace: Option<String>,
    },
    /// Mirror deployments from the bus and serve them over HTTP
    Mirror {
        #[arg(long = "http-addr", env = "ORDIN_HTTP_ADDR", default_value = "0.0.0.0:8080")]
        http_addr: SocketAddr,
        /// Partitions to subscribe to (default: all)
        #[arg(long = "partition", env = "ORDIN_PARTITIONS", value_delimiter = ',')]
        partitions: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("ORDIN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ORDIN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid ORDIN_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `token` on Ctrl-C or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                    _ = term.recv() => info!("SIGTERM received"),
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM; Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    }
    token.cancel();
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut cfg = PipelineConfig::from_env();
        if let Some(n) = self.max_retries {
            cfg.max_retries = n;
        }
        match &self.command {
            Commands::Controller { namespace } => {
                if let Some(w) = self.workers {
                    cfg.producer_workers = w;
                }
                if namespace.is_some() {
                    cfg.namespace = namespace.clone();
                }
            }
            Commands::Mirror { partitions, .. } => {
                if let Some(w) = self.workers {
                    cfg.consumer_workers = w;
                }
                if !partitions.is_empty() {
                    cfg.partitions = Some(partitions.clone());
                }
            }
        }
        cfg
    }
}

async fn run_controller(cfg: PipelineConfig, bus: Arc<dyn Bus>, cancel: CancellationToken) -> Result<()> {
    let api = ordin_kubehub::api_for::<Deployment>(cfg.namespace.as_deref()).await?;
    info!(ns = ?cfg.namespace, workers = cfg.producer_workers, "controller starting");
    let producer = Producer::<Deployment>::new(cfg, Arc::new(PipelineStats::new()));
    let watch = ordin_kubehub::spawn_watcher(api, producer.handler(), cancel.clone());
    producer.run(watch, bus, cancel).await
}

async fn run_mirror(cfg: PipelineConfig, http_addr: SocketAddr, bus: Arc<dyn Bus>, cancel: CancellationToken) -> Result<()> {
    let stats = Arc::new(PipelineStats::new());
    let consumer = Consumer::<Deployment>::new(cfg, stats.clone());
    let running = consumer.start(bus.as_ref(), cancel.clone()).await?;
    let listener = match TcpListener::bind(http_addr).await {
        Ok(l) => l,
        Err(e) => {
            cancel.cancel();
            running.join().await;
            return Err(e).with_context(|| format!("binding {}", http_addr));
        }
    };
    let app = ordin_api::router(ApiState::new(consumer.store(), stats));
    let served = ordin_api::serve(listener, app, cancel.clone()).await;
    cancel.cancel();
    running.join().await;
    served.context("serving read api")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = cli.pipeline_config();

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let info = connection_info(&cli.redis.addr, cli.redis.username.clone(), cli.redis.password.clone())?;
    let bus: Arc<dyn Bus> = Arc::new(RedisBus::connect(info).await.context("connecting to redis")?);

    match cli.command {
        Commands::Controller { .. } => run_controller(cfg, bus, cancel).await,
        Commands::Mirror { http_addr, .. } => run_mirror(cfg, http_addr, bus, cancel).await,
    }
}
