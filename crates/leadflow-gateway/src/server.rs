//! HTTP server implementation using Axum.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use leadflow_core::config::GatewayConfig;
use leadflow_engine::{DispatchWorker, LeadEngine, UnsubscribeLinks};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub gateway_config: GatewayConfig,
    pub engine: Arc<LeadEngine>,
    /// Used by `POST /api/v1/dispatch/run`.
    pub dispatcher: Arc<DispatchWorker>,
    pub links: UnsubscribeLinks,
    pub start_time: std::time::Instant,
}

/// API key middleware. Accepts `Authorization: Bearer <key>` or `X-Api-Key`.
/// Open when no key is configured.
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let Some(expected) = state.gateway_config.api_key.as_deref().filter(|k| !k.is_empty()) else {
        return next.run(req).await;
    };

    let headers = req.headers();
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key = headers.get("X-Api-Key").and_then(|v| v.to_str().ok());

    if bearer.or(api_key).is_some_and(|k| constant_time_eq(k.trim(), expected)) {
        return next.run(req).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"ok": false, "error": "Unauthorized: invalid or missing API key"})),
    )
        .into_response()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    use super::routes;

    // Protected routes: require the API key when one is configured
    let protected = Router::new()
        .route("/api/v1/leads", post(routes::register_lead))
        .route("/api/v1/leads/{id}", get(routes::get_lead))
        .route("/api/v1/leads/{id}/stages", post(routes::stage_complete))
        .route("/api/v1/leads/{id}/unsubscribe", post(routes::unsubscribe_lead))
        .route("/api/v1/sequences/{id}/pause", post(routes::pause_sequence))
        .route("/api/v1/sequences/{id}/resume", post(routes::resume_sequence))
        .route("/api/v1/sequences/{id}/messages", get(routes::sequence_messages))
        .route("/api/v1/dispatch/run", post(routes::run_dispatch))
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_api_key,
        ));

    // Public routes: the unsubscribe link is authenticated by its signed token
    let public = Router::new()
        .route("/health", get(routes::health_check))
        .route("/unsubscribe", get(routes::unsubscribe_link));

    protected
        .merge(public)
        .layer(
            CorsLayer::new()
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
                .allow_headers(Any)
                .allow_origin(Any)
                .max_age(std::time::Duration::from_secs(3600)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Serve until `shutdown` flips to `true`.
pub async fn start_server(state: AppState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.gateway_config.host, state.gateway_config.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid gateway address: {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    if state.gateway_config.api_key.is_none() {
        tracing::warn!("⚠️ No gateway API key configured, /api/v1 is open");
    }
    tracing::info!("🌐 Gateway listening on http://{}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

    tracing::info!("🛑 Gateway stopped");
    Ok(())
}
