//! AskForge API Gateway
//!
//! The entry point for chat clients.
//! Handles:
//! - Streaming answers over SSE
//! - Stopping in-flight answers by task id
//! - Rate limiting
//! - Observability (logging, metrics)

mod handlers;
mod middleware;
mod state;

use askforge_common::{config::AppConfig, metrics};
use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub use state::AppState;

use middleware::metrics::track_requests;
use middleware::rate_limit::{rate_limit_middleware, RateLimit};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().inspect_err(|e| eprintln!("Failed to load configuration: {}", e))?;

    init_tracing(&config);
    info!(
        service = %config.observability.service_name,
        "Starting AskForge API Gateway v{}",
        askforge_common::VERSION
    );

    // Initialize metrics
    if config.observability.metrics_port != 0 {
        let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .set_buckets_for_metric(
                Matcher::Full(format!("{}_model_first_packet_seconds", metrics::METRICS_PREFIX)),
                metrics::FIRST_PACKET_BUCKETS,
            )?
            .install()?;
        info!(addr = %metrics_addr, "Prometheus exporter listening");
    }
    metrics::register_metrics();

    let state = AppState::build(config).await.inspect_err(|e| {
        error!(error = %e, "Failed to initialize services");
    })?;

    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port).parse()?;
    let app = create_router(state);

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let mut chat_routes = Router::new()
        .route("/chat/stream", post(handlers::chat::stream_chat))
        .route("/chat/tasks/{task_id}/stop", post(handlers::chat::stop_task));

    let limits = &state.config.rate_limit;
    if limits.enabled {
        let limit = RateLimit::new(limits.requests_per_second, limits.burst);
        chat_routes = chat_routes.route_layer(from_fn_with_state(limit, rate_limit_middleware));
    }

    Router::new()
        // Health endpoints (never rate limited)
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .nest("/v1", chat_routes)
        .route_layer(from_fn(track_requests))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
