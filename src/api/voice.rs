//! HTTP voice test entry
//!
//! Accepts the same binary voice frame the MQTT path carries, so the full
//! pipeline can be exercised without a broker or a device.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde::Deserialize;

use super::{failure, ok, ApiState};
use crate::transport::middleware::MessageContext;
use crate::Error;

#[derive(Deserialize)]
pub struct VoiceQuery {
    /// Device serial number the frame pretends to come from
    sn: String,
}

/// `POST /voice?sn={sn}` with a framed payload body
pub async fn upload(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<VoiceQuery>,
    body: Bytes,
) -> Response {
    if query.sn.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "sn is required");
    }
    if body.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "empty body");
    }

    let mut ctx = MessageContext::new();
    ctx.device_sn = Some(query.sn.clone());

    let cancel = state.shutdown.child_token();
    match state.pipeline.handle_frame(cancel, &ctx, &body).await {
        Ok(()) => ok(ctx.trace_id),
        Err(Error::Frame(e)) => failure(StatusCode::BAD_REQUEST, &e.to_string()),
        Err(e) => {
            tracing::error!(error = %e, sn = %query.sn, trace_id = %ctx.trace_id, "voice upload failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "voice processing failed")
        }
    }
}
