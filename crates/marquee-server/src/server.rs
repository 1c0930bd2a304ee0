use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use marquee_engine::{start_sweep_task, RequestResolver, ResolutionRequest};
use marquee_telemetry::MetricsRecorder;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Serialize requests from the same user.
    pub per_user_sequencing: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
            per_user_sequencing: false,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<RequestResolver>,
    pub metrics: Arc<MetricsRecorder>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(message_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, serve, and sweep expired contexts every `sweep_interval`.
pub async fn start(
    config: &ServerConfig,
    resolver: Arc<RequestResolver>,
    metrics: Arc<MetricsRecorder>,
    sweep_interval: Duration,
) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let sweep = start_sweep_task(Arc::clone(resolver.store()), sweep_interval, shutdown.clone());

    let router = build_router(AppState { resolver, metrics });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(host = %config.host, port = local_addr.port(), "Marquee server started");

    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move { signal.cancelled().await });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        tasks: vec![server, sweep],
    })
}

/// Handle returned by `start()`: keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting requests and wait for the server and sweep tasks.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!(port = self.port, "Marquee server stopped");
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message.into()}))).into_response()
}

async fn message_handler(
    State(state): State<AppState>,
    body: Result<Json<ResolutionRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    if request.user_id.as_str().trim().is_empty() {
        return bad_request("userId must not be empty");
    }
    if request.text.trim().is_empty() {
        return bad_request("text must not be empty");
    }
    Json(state.resolver.handle(request).await).into_response()
}

/// Health check HTTP endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
