//! Administrative HTTP surface of the volume.

use axum::{
    Extension, Json, Router,
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::distribute::Distribute;
use crate::error::Errno;
use crate::fop::Loc;
use crate::rebalance::types::{RebalanceStatus, TaskId};
use crate::selfheal::HealthReport;
use crate::topology::types::TopologyEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminResponse {
    pub success: bool,
    pub task_id: Option<TaskId>,
    pub error: Option<String>,
}

impl AdminResponse {
    fn ok(task_id: Option<TaskId>) -> Self {
        Self {
            success: true,
            task_id,
            error: None,
        }
    }

    fn failed(errno: Errno) -> (StatusCode, Json<Self>) {
        (
            status_of(errno),
            Json(Self {
                success: false,
                task_id: None,
                error: Some(errno.to_string()),
            }),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyResponse {
    pub changed: bool,
    pub generation: u64,
}

pub fn status_of(errno: Errno) -> StatusCode {
    match errno {
        Errno::ENOENT | Errno::ESTALE => StatusCode::NOT_FOUND,
        Errno::EINVAL | Errno::ENOTDIR => StatusCode::BAD_REQUEST,
        Errno::ENOTCONN | Errno::ETIMEDOUT => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn admin_router(volume: Arc<Distribute>) -> Router {
    Router::new()
        .route("/admin/fix-layout", post(handle_fix_layout))
        .route("/admin/rebalance", post(handle_rebalance))
        .route("/admin/rebalance/status", get(handle_rebalance_status))
        .route("/admin/health", get(handle_health))
        .route("/admin/topology", post(handle_topology))
        .layer(Extension(volume))
}

pub async fn handle_fix_layout(
    Extension(volume): Extension<Arc<Distribute>>,
    Json(req): Json<PathRequest>,
) -> (StatusCode, Json<AdminResponse>) {
    match volume.fix_layout(&Loc::new(&req.path)).await {
        Ok(_) => (StatusCode::OK, Json(AdminResponse::ok(None))),
        Err(errno) => {
            tracing::warn!("fix-layout of {} failed: {}", req.path, errno);
            AdminResponse::failed(errno)
        }
    }
}

pub async fn handle_rebalance(
    Extension(volume): Extension<Arc<Distribute>>,
    Json(req): Json<PathRequest>,
) -> (StatusCode, Json<AdminResponse>) {
    match volume.rebalance(&Loc::new(&req.path)).await {
        Ok(task_id) => {
            tracing::info!("Rebalance task {} queued for {}", task_id.0, req.path);
            (StatusCode::OK, Json(AdminResponse::ok(Some(task_id))))
        }
        Err(errno) => {
            tracing::warn!("Rebalance of {} refused: {}", req.path, errno);
            AdminResponse::failed(errno)
        }
    }
}

pub async fn handle_rebalance_status(
    Extension(volume): Extension<Arc<Distribute>>,
) -> (StatusCode, Json<RebalanceStatus>) {
    (StatusCode::OK, Json(volume.rebalance_status()))
}

pub async fn handle_health(Extension(volume): Extension<Arc<Distribute>>) -> (StatusCode, Json<HealthReport>) {
    (StatusCode::OK, Json(volume.health()))
}

pub async fn handle_topology(
    Extension(volume): Extension<Arc<Distribute>>,
    Json(event): Json<TopologyEvent>,
) -> (StatusCode, Json<TopologyResponse>) {
    let changed = volume.notify(event);
    (
        StatusCode::OK,
        Json(TopologyResponse {
            changed,
            generation: volume.registry().generation(),
        }),
    )
}
