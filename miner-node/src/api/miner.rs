//! Task history and earnings.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use miner_common::{EarningsSummary, TaskHistory};

use crate::error::Result;
use crate::state::AppState;

const MAX_PAGE_SIZE: u32 = 100;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/miner/history", get(history))
        .route("/api/v1/miner/summary", get(summary))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    10
}

/// GET /api/v1/miner/history?page&limit - tasks, newest first.
async fn history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<TaskHistory>> {
    let page = query.page.max(1);
    let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
    Ok(Json(state.store.task_history(page, limit)?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MinerSummary {
    device_id: String,
    device_name: String,
    is_registered: bool,
    earnings: EarningsSummary,
}

/// GET /api/v1/miner/summary
async fn summary(State(state): State<Arc<AppState>>) -> Result<Json<MinerSummary>> {
    let config = state.registration.current_config();
    Ok(Json(MinerSummary {
        device_id: config.device_id,
        device_name: config.device_name,
        is_registered: config.is_registered,
        earnings: state.store.earnings_summary()?,
    }))
}
