use super::AppState;
use crate::error::RunError;
use crate::orchestrator::RunOptions;
use crate::status::render_status;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub(super) const SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Debug, Default, Deserialize)]
pub(super) struct TriggerQuery {
    #[serde(default)]
    dry_run: bool,
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn error_response(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

/// GET /health
pub(super) async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let run_active = state
        .orchestrator
        .store()
        .load()
        .ok()
        .map(|run_state| run_state.is_locked());
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "run_active": run_active,
    }))
}

/// POST /trigger
pub(super) async fn handle_trigger(
    State(state): State<AppState>,
    Query(query): Query<TriggerQuery>,
    headers: HeaderMap,
) -> Response {
    if let Some(secret) = &state.webhook_secret {
        let provided = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if !provided.is_some_and(|value| constant_time_eq(value, secret)) {
            tracing::warn!("Rejected trigger with a missing or invalid webhook secret");
            return error_response(
                StatusCode::UNAUTHORIZED,
                json!({ "error": format!("missing or invalid {SECRET_HEADER}") }),
            );
        }
    }
    if state.cancel.is_cancelled() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "error": "server is shutting down" }),
        );
    }

    let claim = match state.orchestrator.claim().await {
        Ok(claim) => claim,
        Err(RunError::RunAlreadyInProgress { holder, since }) => {
            return error_response(
                StatusCode::CONFLICT,
                json!({ "error": "run already in progress", "holder": holder, "since": since }),
            );
        }
        Err(e) => {
            tracing::error!("Could not claim the run lock: {e}");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": e.to_string() }),
            );
        }
    };

    let run_id = claim.run_id().to_string();
    let options = RunOptions {
        dry_run: query.dry_run,
    };
    let orchestrator = Arc::clone(&state.orchestrator);
    let cancel = state.cancel.clone();
    state.runs.spawn(async move {
        // The orchestrator logs and records the outcome.
        let _ = orchestrator.run_claimed(claim, options, &cancel).await;
    });
    tracing::info!(run_id = %run_id, dry_run = options.dry_run, "Run triggered over HTTP");

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "run_id": run_id,
            "dry_run": options.dry_run,
            "message": "run started",
        })),
    )
        .into_response()
}

/// GET /status
pub(super) async fn handle_status(State(state): State<AppState>) -> Response {
    match state.orchestrator.store().load() {
        Ok(run_state) => {
            render_status(state.orchestrator.config(), &run_state, Utc::now()).into_response()
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": e.to_string() }),
        ),
    }
}
