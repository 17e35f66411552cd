//! Device administration handlers

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;

use super::{failure, ok, ApiState};
use crate::db::Device;

/// `GET /api/device/fetch`
pub async fn fetch_all(State(state): State<Arc<ApiState>>) -> Response {
    match state.devices.list() {
        Ok(devices) => ok(devices),
        Err(e) => {
            tracing::error!(error = %e, "device list failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "device list failed")
        }
    }
}

/// `GET /api/device/fetch/{sn}`
pub async fn fetch_one(
    State(state): State<Arc<ApiState>>,
    Path(sn): Path<String>,
) -> Response {
    match state.devices.get(&sn) {
        Ok(Some(device)) => ok(device),
        Ok(None) => failure(StatusCode::NOT_FOUND, "device not found"),
        Err(e) => {
            tracing::error!(error = %e, sn = %sn, "device fetch failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "device fetch failed")
        }
    }
}

/// `PUT /api/device/update`
pub async fn update(
    State(state): State<Arc<ApiState>>,
    Json(device): Json<Device>,
) -> Response {
    if device.sn.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "device sn is required");
    }
    match state.devices.upsert(&device) {
        Ok(()) => ok(device),
        Err(e) => {
            tracing::error!(error = %e, sn = %device.sn, "device update failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "device update failed")
        }
    }
}

/// `DELETE /api/device/delete/{sn}`
pub async fn remove(
    State(state): State<Arc<ApiState>>,
    Path(sn): Path<String>,
) -> Response {
    match state.devices.delete(&sn) {
        Ok(true) => ok(sn),
        Ok(false) => failure(StatusCode::NOT_FOUND, "device not found"),
        Err(e) => {
            tracing::error!(error = %e, sn = %sn, "device delete failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "device delete failed")
        }
    }
}
