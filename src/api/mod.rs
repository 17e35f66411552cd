//! Administrative HTTP surface
//!
//! Device inspection endpoints plus a `/voice` test entry that accepts the
//! same binary voice frame the MQTT path carries. Responses wrap payloads in
//! a `{Code, Message, Data}` envelope whose code mirrors the HTTP status.

mod device;
mod voice;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::db::DeviceRepo;
use crate::pipeline::DialogPipeline;
use crate::Result;

/// Shared state for API handlers
pub struct ApiState {
    /// Device registry
    pub devices: DeviceRepo,
    /// Voice pipeline backing the `/voice` test endpoint
    pub pipeline: Arc<DialogPipeline>,
    /// Gateway shutdown signal, parent of per-request cancellation
    pub shutdown: CancellationToken,
}

/// Response envelope; `Code` mirrors the HTTP status
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope<T: Serialize> {
    code: u16,
    message: String,
    data: Option<T>,
}

fn reply<T: Serialize>(status: StatusCode, message: &str, data: Option<T>) -> Response {
    (
        status,
        Json(Envelope {
            code: status.as_u16(),
            message: message.to_string(),
            data,
        }),
    )
        .into_response()
}

fn ok<T: Serialize>(data: T) -> Response {
    reply(StatusCode::OK, "ok", Some(data))
}

fn failure(status: StatusCode, message: &str) -> Response {
    reply::<()>(status, message, None)
}

/// Build the admin router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/device/fetch", get(device::fetch_all))
        .route("/api/device/fetch/:sn", get(device::fetch_one))
        .route("/api/device/update", put(device::update))
        .route("/api/device/delete/:sn", delete(device::remove))
        .route("/voice", post(voice::upload))
        .with_state(state)
}

/// Serve the admin API until `shutdown` fires
///
/// # Errors
///
/// Returns an error when the listener cannot bind or the server fails.
pub async fn serve(state: Arc<ApiState>, port: u16, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "admin api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
