//! API route handlers for the gateway.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use leadflow_core::error::LeadflowError;
use leadflow_core::types::{NewLead, StageSignals};
use serde::Deserialize;

use crate::server::AppState;

/// Error response: `{"ok": false, "error": "..."}` with a status matching the error kind.
#[derive(Debug)]
pub struct ApiError(pub LeadflowError);

impl From<LeadflowError> for ApiError {
    fn from(e: LeadflowError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LeadflowError::NotFound(_) => StatusCode::NOT_FOUND,
            LeadflowError::Validation(_) | LeadflowError::Serialization(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            LeadflowError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
            LeadflowError::Delivery(_) => StatusCode::BAD_GATEWAY,
            LeadflowError::Config(_) | LeadflowError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("❌ {}", self.0);
        }
        (
            status,
            Json(serde_json::json!({"ok": false, "error": self.0.to_string()})),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let queue = state.engine.store().queue_stats();
    Json(serde_json::json!({
        "status": if queue.is_ok() { "ok" } else { "degraded" },
        "service": "leadflow-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "queue": queue.ok(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeQuery {
    pub lead: String,
    pub token: String,
}

/// Target of the link in every message footer.
pub async fn unsubscribe_link(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UnsubscribeQuery>,
) -> (StatusCode, Html<String>) {
    if !state.links.verify(&query.lead, &query.token) {
        tracing::warn!("🚫 Rejected unsubscribe link for {}", query.lead);
        return (
            StatusCode::FORBIDDEN,
            page("This unsubscribe link is not valid."),
        );
    }
    match state.engine.unsubscribe(&query.lead) {
        Ok(_) => (
            StatusCode::OK,
            page("You have been unsubscribed. You will not receive further emails from us."),
        ),
        Err(LeadflowError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            page("We could not find your subscription."),
        ),
        Err(e) => {
            tracing::error!("❌ Unsubscribe for {} failed: {}", query.lead, e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                page("Something went wrong. Please try the link again in a few minutes."),
            )
        }
    }
}

fn page(message: &str) -> Html<String> {
    Html(format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>Unsubscribe</title></head>\
         <body style=\"font-family:sans-serif;max-width:32rem;margin:4rem auto\"><p>{message}</p></body></html>"
    ))
}

/// Register a lead from the funnel.
pub async fn register_lead(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewLead>,
) -> ApiResult {
    let lead = state.engine.register_lead(body)?;
    Ok(Json(serde_json::json!({"ok": true, "lead": lead})))
}

pub async fn get_lead(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let overview = state.engine.lead_overview(&id)?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "lead": overview.lead,
        "sequences": overview.sequences,
    })))
}

/// Funnel stage completed. Bookkeeping failures never fail this call.
pub async fn stage_complete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(signals): Json<StageSignals>,
) -> ApiResult {
    let outcome = state.engine.on_stage_complete(&id, signals)?;
    Ok(Json(serde_json::json!({"ok": true, "outcome": outcome})))
}

/// Unsubscribe callback from the funnel or an email provider webhook.
pub async fn unsubscribe_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let report = state.engine.unsubscribe(&id)?;
    Ok(Json(serde_json::json!({"ok": true, "report": report})))
}

pub async fn pause_sequence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let sequence = state.engine.pause(&id)?;
    Ok(Json(serde_json::json!({"ok": true, "sequence": sequence})))
}

pub async fn resume_sequence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let sequence = state.engine.resume(&id)?;
    Ok(Json(serde_json::json!({"ok": true, "sequence": sequence})))
}

pub async fn sequence_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let messages = state.engine.sequence_messages(&id)?;
    Ok(Json(serde_json::json!({"ok": true, "messages": messages})))
}

/// Run one dispatch cycle now (external scheduler trigger).
pub async fn run_dispatch(State(state): State<Arc<AppState>>) -> ApiResult {
    let report = state.dispatcher.run_once().await?;
    Ok(Json(serde_json::json!({"ok": true, "report": report})))
}
