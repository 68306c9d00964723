use axum::{Extension, Router, body::Bytes, http::StatusCode, routing::post};
use std::sync::Arc;

use super::store::MemoryBrick;
use crate::transport::protocol::{self, ENDPOINT_FOP, FopRequest, FopResponse};

/// Routes serving one brick.
pub fn brick_router(brick: Arc<MemoryBrick>) -> Router {
    Router::new()
        .route(ENDPOINT_FOP, post(handle_fop))
        .layer(Extension(brick))
}

pub async fn handle_fop(
    Extension(brick): Extension<Arc<MemoryBrick>>,
    body: Bytes,
) -> (StatusCode, Vec<u8>) {
    let request: FopRequest = match protocol::decode(&body) {
        Ok(req) => req,
        Err(_) => {
            tracing::error!("Undecodable frame ({} bytes)", body.len());
            return (StatusCode::BAD_REQUEST, Vec::new());
        }
    };

    tracing::debug!(
        "{} {} {} on {}",
        request.op_id,
        request.fop.name(),
        request.fop.loc(),
        brick.id
    );

    let response = FopResponse {
        result: brick.handle(request.fop).await,
    };

    match protocol::encode(&response) {
        Ok(raw) => (StatusCode::OK, raw),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()),
    }
}
