// HTTP server - probe, self metrics and health endpoints

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::SecondsFormat;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::cache::ProbeCache;
use crate::config::Config;
use crate::probe::{probe, ProbeParams};
use crate::source::QueryExecutor;
use crate::telemetry::ExporterMetrics;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared state of all request handlers
pub struct AppState {
    pub config: Arc<Config>,
    pub executor: Arc<dyn QueryExecutor>,
    /// Subscriptions used by queries without their own list
    pub subscriptions: Vec<String>,
    pub cache: Arc<ProbeCache>,
    pub metrics: ExporterMetrics,
}

pub fn router(state: Arc<AppState>, timeout: Duration) -> Router {
    Router::new()
        .route("/probe", get(probe_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Expands a Go-style `:8080` bind address to all interfaces
pub fn bind_address(bind: &str) -> String {
    if bind.starts_with(':') {
        format!("0.0.0.0{}", bind)
    } else {
        bind.to_string()
    }
}

/// Serves the router until ctrl-c is received
pub async fn serve(state: Arc<AppState>, bind: &str, timeout: Duration) -> anyhow::Result<()> {
    let addr = bind_address(bind);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Listening on {}", addr);

    axum::serve(listener, router(state, timeout).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {}", e);
        return;
    }
    info!("Received shutdown signal");
}

async fn probe_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProbeParams>,
) -> Response {
    match probe(&state, &params).await {
        Ok(outcome) => {
            let mut response = (
                [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
                outcome.body,
            )
                .into_response();

            let headers = response.headers_mut();
            headers.insert(
                "x-metrics-cached",
                HeaderValue::from_static(if outcome.cached { "true" } else { "false" }),
            );
            if let Some(until) = outcome.cached_until {
                let until = until.to_rfc3339_opts(SecondsFormat::Secs, true);
                if let Ok(value) = HeaderValue::from_str(&until) {
                    headers.insert("x-metrics-cached-until", value);
                }
            }

            response
        }
        Err(e) => {
            error!(module = %params.module, "probe failed: {}", e);
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(output) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], output).into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn healthz_handler() -> &'static str {
    "Ok"
}
