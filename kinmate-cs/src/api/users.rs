//! Per-user history and session control

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::error::ApiResult;
use crate::history::{Round, SummaryState};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub user_id: String,
    pub rounds: Vec<Round>,
    pub summary: SummaryState,
}

#[derive(Debug, Serialize)]
pub struct CloseResponse {
    pub user_id: String,
    /// `false` when the user had no running session
    pub finalized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// GET /users/:user_id/history
pub async fn get_history(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<HistoryResponse>> {
    let history = state.service.history();
    let rounds = history.all(&user_id).await?;
    let summary = history.summary(&user_id).await?;
    Ok(Json(HistoryResponse {
        user_id,
        rounds,
        summary,
    }))
}

/// POST /users/:user_id/close
pub async fn close_session(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<CloseResponse> {
    let summary = state.service.sessions().close(&user_id).await;
    Json(CloseResponse {
        user_id,
        finalized: summary.is_some(),
        summary,
    })
}

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/users/:user_id/history", get(get_history))
        .route("/users/:user_id/close", post(close_session))
}
