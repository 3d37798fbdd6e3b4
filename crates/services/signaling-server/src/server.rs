//! HTTP front end for the signaling coordinator
//!
//! Endpoints:
//! - POST /signaling - Signaling request (offer, ice-candidate, poll, close)
//! - GET / - Browser viewer
//! - GET /health - Health check
//! - GET /stats - Coordinator statistics
//!
//! Signaling failures are reported in the JSON body (`"type":"error"`), not
//! through the HTTP status.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use streamcast_signaling::{Coordinator, ResponseMessage};
use tracing::{debug, error, info};

/// Browser client served at `/`
const VIEWER_PAGE: &str = include_str!("../static/client.html");

/// Build the router with all endpoints
pub fn build_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/", get(viewer_handler))
        .route("/signaling", post(signaling_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .fallback(not_found_handler)
        .with_state(coordinator)
        .layer(
            tower::ServiceBuilder::new()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(tower_http::cors::CorsLayer::permissive()),
        )
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(coordinator: Arc<Coordinator>, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(coordinator);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Signaling server listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;

    info!("HTTP server stopped");
    Ok(())
}

async fn signaling_handler(State(coordinator): State<Arc<Coordinator>>, body: Bytes) -> Response {
    debug!(bytes = body.len(), "Signaling request");
    let response = coordinator.handle_request(&body).await;
    json_response(&response)
}

fn json_response(response: &ResponseMessage) -> Response {
    let body = match response.to_json() {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize signaling response: {}", e);
            r#"{"type":"error","message":"internal serialization failure"}"#.to_string()
        }
    };
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

async fn viewer_handler() -> Html<&'static str> {
    Html(VIEWER_PAGE)
}

async fn health_handler(State(coordinator): State<Arc<Coordinator>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": streamcast_signaling::version(),
        "sessions": coordinator.registry().len(),
    }))
}

async fn stats_handler(State(coordinator): State<Arc<Coordinator>>) -> Response {
    Json(coordinator.stats()).into_response()
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}
