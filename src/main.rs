//! Multishare Controller
//!
//! Runs the controller: rebuilds state from the resource store, drives
//! operations in the background and serves the REST, health and metrics
//! endpoints until interrupted.

use anyhow::Context;
use clap::Parser;
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use multishare_controller::{
    ApiServer, ApiServerConfig, ControllerConfig, ControllerMetrics, InMemoryFilestore,
    MultishareController, StoreFactory,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Multishare Controller - packs file shares onto shared storage instances
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: SocketAddr,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Controller configuration file (YAML)
    #[arg(long, env = "CONTROLLER_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Resource store: memory or kube
    #[arg(long, env = "STORE", default_value = "kube")]
    store: String,

    /// Polls after which simulated backend operations complete
    #[arg(long, env = "BACKEND_POLLS", default_value = "3")]
    backend_polls: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting Multishare Controller");
    info!("  Version: {}", multishare_controller::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Standalone mode: {}", args.standalone);

    let config = match &args.config {
        Some(path) => ControllerConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ControllerConfig::default(),
    };

    let store_name = if args.standalone { "memory" } else { args.store.as_str() };
    let client = if store_name == "memory" {
        None
    } else {
        Some(
            kube::Client::try_default()
                .await
                .context("connecting to the Kubernetes API")?,
        )
    };
    let store = StoreFactory::create(store_name, client)?;
    info!("  Resource store: {}", store_name);

    let registry = Arc::new(Registry::new());
    let metrics = Arc::new(ControllerMetrics::new(&registry)?);
    let backend = Arc::new(InMemoryFilestore::new(args.backend_polls));

    let controller = MultishareController::new(config, backend, store, Some(metrics))?;
    let rebuilt = controller.rebuild().await.context("rebuilding state")?;
    info!(
        "State rebuilt: {} instances, {} shares, {} operations",
        rebuilt.instances, rebuilt.shares, rebuilt.operations
    );

    let cancel = CancellationToken::new();

    let reconciler = {
        let controller = controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run_reconciler(cancel).await })
    };

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, registry).await {
            error!("Metrics server error: {}", e);
        }
    });

    let api_server = Arc::new(ApiServer::new(
        ApiServerConfig {
            rest_addr: args.api_addr,
        },
        controller.clone(),
    ));
    let api = {
        let api_server = api_server.clone();
        tokio::spawn(async move { api_server.run().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    cancel.cancel();
    api_server.shutdown();
    if let Err(e) = reconciler.await {
        error!("Reconciler task failed: {:?}", e);
    }
    match api.await {
        Ok(Err(e)) => error!("API server error: {}", e),
        Err(e) => error!("API server task failed: {:?}", e),
        Ok(Ok(())) => {}
    }

    info!("Controller shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("tower=warn".parse()?)
        .add_directive("axum=info".parse()?);

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
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .context("health server")?;
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, registry: Arc<Registry>) -> anyhow::Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

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
                                    let mut response = text_response(StatusCode::OK, buffer);
                                    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                        response.headers_mut().insert(CONTENT_TYPE, value);
                                    }
                                    response
                                }
                                Err(e) => text_response(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    format!("encoding metrics: {}", e),
                                ),
                            }
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .context("metrics server")?;
    Ok(())
}
