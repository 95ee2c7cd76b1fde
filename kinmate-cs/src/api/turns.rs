//! Turn submission

use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;
use tracing::debug;

use crate::error::ApiResult;
use crate::pipeline::{TurnOutcome, TurnRequest};
use crate::AppState;

/// POST /turns body; `user_id` falls back to the configured default user
#[derive(Debug, Deserialize)]
pub struct TurnBody {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub audio_id: Option<String>,
    #[serde(default = "default_final")]
    pub is_final: bool,
    #[serde(default)]
    pub request_id: Option<String>,
}

fn default_final() -> bool {
    true
}

/// POST /turns
pub async fn submit_turn(
    State(state): State<AppState>,
    Json(body): Json<TurnBody>,
) -> ApiResult<Json<TurnOutcome>> {
    let user_id = body
        .user_id
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| state.service.config().default_user_id.clone());
    debug!(user_id = %user_id, audio_id = ?body.audio_id, is_final = body.is_final, "Turn received");

    let request = TurnRequest {
        user_id,
        text: body.text,
        audio_id: body.audio_id,
        is_final: body.is_final,
        request_id: body.request_id,
    };
    let outcome = state.service.handle_turn(request).await?;
    Ok(Json(outcome))
}

pub fn turn_routes() -> Router<AppState> {
    Router::new().route("/turns", post(submit_turn))
}
