//! Storage Provisioner
//!
//! Runs the Storage → PersistentVolumeClaim → VolumeAttachment controller
//! against the cluster the process has credentials for.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Storage Provisioner                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐        │
//! │  │    Caches    │───▶│    Queues    │───▶│  Reconcilers │        │
//! │  │  (watchers)  │    │ (rate-limit) │    │   (writers)  │        │
//! │  └──────────────┘    └──────────────┘    └──────────────┘        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::{Client, CustomResourceExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_provisioner::adapters::{
    AuditLogPublisher, FanOutPublisher, KubeObjectCache, KubeObjectWriter, MetricsEventPublisher,
};
use storage_provisioner::config::{parse_duration, ProvisionerConfig, DEFAULT_CONTROLLER_NAME};
use storage_provisioner::controller::{ClaimReconciler, Controller, StorageReconciler};
use storage_provisioner::crd::Storage;
use storage_provisioner::domain::ObjectCache;
use storage_provisioner::error::{Error, Result};
use storage_provisioner::metrics::ControllerMetrics;
use storage_provisioner::queue::RateLimitingQueue;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Provisioner - reconciles Storage intents into claims and attachments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of worker loops per queue
    #[arg(long, env = "WORKER_THREADS", default_value = "25")]
    worker_threads: usize,

    /// Initial retry interval of a failed reconcile; doubles per failure
    #[arg(long, env = "RETRY_INTERVAL_START", default_value = "1s", value_parser = duration_arg)]
    retry_interval_start: Duration,

    /// Maximum retry interval of a failed reconcile
    #[arg(long, env = "RETRY_INTERVAL_MAX", default_value = "5m", value_parser = duration_arg)]
    retry_interval_max: Duration,

    /// Interval at which every cached object is reconciled again
    #[arg(long, env = "RESYNC", default_value = "10m", value_parser = duration_arg)]
    resync: Duration,

    /// Controller name used in logs and queue names
    #[arg(long, env = "CONTROLLER_NAME", default_value = DEFAULT_CONTROLLER_NAME)]
    controller_name: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the Storage CRD as YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn config(&self) -> ProvisionerConfig {
        ProvisionerConfig {
            controller_name: self.controller_name.clone(),
            worker_threads: self.worker_threads,
            retry_interval_start: self.retry_interval_start,
            retry_interval_max: self.retry_interval_max,
            resync: self.resync,
        }
    }
}

fn duration_arg(s: &str) -> std::result::Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        let crd = serde_yaml::to_string(&Storage::crd())
            .map_err(|e| Error::Internal(format!("Failed to render CRD: {}", e)))?;
        print!("{}", crd);
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.config();
    config.validate()?;

    info!("Starting Storage Provisioner");
    info!("  Controller name: {}", config.controller_name);
    info!("  Worker threads: {}", config.worker_threads);
    info!(
        "  Retry interval: {:?} .. {:?}",
        config.retry_interval_start, config.retry_interval_max
    );
    info!("  Resync: {:?}", config.resync);

    let client = Client::try_default().await.map_err(|e| {
        error!("Failed to create Kubernetes client: {}", e);
        Error::Internal(format!("Kubernetes client creation failed: {}", e))
    })?;
    info!("Connected to Kubernetes cluster");

    let cancel = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));
    let metrics = Arc::new(ControllerMetrics::new()?);

    // Caches
    let storages = Arc::new(KubeObjectCache::<Storage>::new(
        client.clone(),
        "Storage",
        config.resync,
    ));
    let claims = Arc::new(KubeObjectCache::<PersistentVolumeClaim>::new(
        client.clone(),
        "PersistentVolumeClaim",
        config.resync,
    ));
    let attachments = Arc::new(KubeObjectCache::<VolumeAttachment>::new(
        client.clone(),
        "VolumeAttachment",
        config.resync,
    ));

    let events = Arc::new(
        FanOutPublisher::new()
            .with_sink(Arc::new(AuditLogPublisher::new()))
            .with_sink(Arc::new(MetricsEventPublisher::new(metrics.clone()))),
    );
    let storage_reconciler = StorageReconciler::new(
        claims.clone(),
        Arc::new(KubeObjectWriter::<PersistentVolumeClaim>::new(client.clone())),
        attachments.clone(),
        Arc::new(KubeObjectWriter::<Storage>::new(client.clone())),
        events.clone(),
    );
    let claim_reconciler = ClaimReconciler::new(
        attachments.clone(),
        Arc::new(KubeObjectWriter::<VolumeAttachment>::new(client.clone())),
        events,
    );

    let queue = |kind: &str| {
        RateLimitingQueue::with_backoff(
            format!("{}-{}", config.controller_name, kind),
            config.retry_interval_start,
            config.retry_interval_max,
        )
    };

    let controller = Controller::builder()
        .name(config.controller_name.clone())
        .storage_cache(storages.clone())
        .claim_cache(claims.clone())
        .storage_reconciler(Arc::new(storage_reconciler))
        .claim_reconciler(Arc::new(claim_reconciler))
        .storage_queue(queue("storage"))
        .claim_queue(queue("claim"))
        .wait_for({
            let attachments = attachments.clone();
            Arc::new(move || attachments.has_synced())
        })
        .metrics(metrics.clone())
        .readiness(ready.clone())
        .initialize()?;

    // Watchers feeding the caches
    spawn_cache(storages, cancel.clone());
    spawn_cache(claims, cancel.clone());
    spawn_cache(attachments, cancel.clone());

    // Health server
    let health_addr = parse_addr(&args.health_addr, "health")?;
    {
        let ready = ready.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let handler = move |path: &str| health_response(path, &ready);
            if let Err(e) = serve(health_addr, "Health", handler, cancel).await {
                error!("Health server error: {}", e);
            }
        });
    }

    // Metrics server
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics")?;
    {
        let metrics = metrics.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let handler = move |path: &str| metrics_response(path, &metrics);
            if let Err(e) = serve(metrics_addr, "Metrics", handler, cancel).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            cancel.cancel();
        });
    }

    info!("Starting {} controller", controller);
    controller.run(config.worker_threads, cancel.clone()).await?;
    cancel.cancel();

    info!("Provisioner shutdown complete");
    Ok(())
}

fn spawn_cache<K>(cache: Arc<KubeObjectCache<K>>, cancel: CancellationToken)
where
    K: storage_provisioner::adapters::CachedResource,
{
    tokio::spawn(async move { cache.run(cancel).await });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        let directive = directive
            .parse()
            .map_err(|e| Error::Config(format!("Invalid log directive {:?}: {}", directive, e)))?;
        filter = filter.add_directive(directive);
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
    Ok(())
}

// =============================================================================
// Health and Metrics Servers
// =============================================================================

fn parse_addr(addr: &str, server: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Config(format!("Invalid {} server address {:?}: {}", server, addr, e)))
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn health_response(path: &str, ready: &AtomicBool) -> Response<Full<Bytes>> {
    match path {
        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
        "/readyz" if ready.load(Ordering::SeqCst) => text(StatusCode::OK, "ok"),
        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "caches not synced"),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

fn metrics_response(path: &str, metrics: &ControllerMetrics) -> Response<Full<Bytes>> {
    if path != "/metrics" {
        return text(StatusCode::NOT_FOUND, "not found");
    }
    match metrics.encode() {
        Ok((content_type, body)) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics")
        }
    }
}

async fn serve<F>(addr: SocketAddr, server: &'static str, handler: F, cancel: CancellationToken) -> Result<()>
where
    F: Fn(&str) -> Response<Full<Bytes>> + Clone + Send + Sync + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server: {}", server, e)))?;

    info!("{} server listening on {}", server, addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("{} server accept error: {}", server, e)))?,
        };

        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = handler(req.uri().path());
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("{} server connection error: {}", server, e);
            }
        });
    }
}
