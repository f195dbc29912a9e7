//! `evergreen serve`: start runs from a webhook and report run status over
//! HTTP.
//!
//! - `GET  /health`  liveness plus whether a run holds the lock
//! - `POST /trigger` claim the run lock and start a run in the background
//!   (`202`), or `409` while another run holds it
//! - `GET  /status`  the `evergreen status` report as plain text

mod handlers;

use crate::config::WebhookConfig;
use crate::orchestrator::Orchestrator;
use anyhow::{Context, Result};
use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};
use handlers::{handle_health, handle_status, handle_trigger};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (trigger payloads are ignored).
pub const MAX_BODY_SIZE: usize = 16_384;
/// Request timeout; triggered runs continue after their response is sent.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub webhook_secret: Option<Arc<str>>,
    /// Cancelled on shutdown. Triggered runs observe it at phase boundaries.
    pub cancel: CancellationToken,
    /// Runs started by `POST /trigger` that have not finished yet.
    pub runs: TaskTracker,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        webhook_secret: Option<&str>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            webhook_secret: webhook_secret.map(Arc::from),
            cancel,
            runs: TaskTracker::new(),
        }
    }
}

/// Returns true when the bind address is not a loopback address.
fn is_public_bind(host: &str) -> bool {
    !matches!(
        host,
        "127.0.0.1" | "localhost" | "::1" | "[::1]" | "0:0:0:0:0:0:0:1"
    )
}

/// Bind `host:port` and serve until `cancel` fires.
pub async fn run_server(
    host: &str,
    port: u16,
    config: &WebhookConfig,
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
) -> Result<()> {
    if is_public_bind(host) && !config.allow_public_bind {
        anyhow::bail!(
            "Refusing to bind to {host}: anyone who can reach it could trigger runs.\n\
             Fix: use --host 127.0.0.1 (default), or set\n\
             [webhook] allow_public_bind = true and a [webhook] secret in config.toml."
        );
    }
    if is_public_bind(host) && config.resolved_secret().is_none() {
        tracing::warn!(host, "Webhook server is publicly bound without a secret");
    }

    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("bind webhook socket {host}:{port}"))?;

    let state = AppState::new(orchestrator, config.resolved_secret(), cancel);
    run_server_with_listener(listener, state).await
}

/// Serve from a pre-bound listener. Returns once `state.cancel` fires and
/// every triggered run has released its lock.
pub async fn run_server_with_listener(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("get webhook listener local address")?;
    tracing::info!(
        addr = %addr,
        secret = state.webhook_secret.is_some(),
        "Webhook server listening"
    );

    let shutdown = state.cancel.clone();
    let runs = state.runs.clone();
    axum::serve(listener, build_app(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("serve webhook endpoint")?;

    runs.close();
    if !runs.is_empty() {
        tracing::info!(runs = runs.len(), "Waiting for triggered runs to stop");
    }
    runs.wait().await;
    tracing::info!("Webhook server stopped");
    Ok(())
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/trigger", post(handle_trigger))
        .route("/status", get(handle_status))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}
