use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::error::MeshError;
use crate::game::controller::{ChatEntry, GameSnapshot};
use crate::game::GameCommand;
use crate::mesh::{JoinMedia, JoinMode};
use crate::state::ServiceContext;

pub type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

pub fn status_for(error: &MeshError) -> StatusCode {
    match error {
        MeshError::NotInSession
        | MeshError::InvalidTransition(_)
        | MeshError::Immune(_)
        | MeshError::DuplicateSession(_) => StatusCode::CONFLICT,
        MeshError::WrongRole(_) => StatusCode::FORBIDDEN,
        MeshError::UnknownParticipant(_) => StatusCode::NOT_FOUND,
        MeshError::SignalingUnavailable(_) | MeshError::RemoteDisconnected(_) => {
            StatusCode::BAD_GATEWAY
        }
        MeshError::SessionRejected
        | MeshError::DeviceUnavailable { .. }
        | MeshError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Run one command and answer `{"ok": true}` or the mapped error.
pub async fn run(ctx: &ServiceContext, command: GameCommand) -> ApiResult<serde_json::Value> {
    ctx.game
        .send(command)
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(|e| (status_for(&e), e.to_string()))
}

pub async fn get_game(State(ctx): State<ServiceContext>) -> Json<GameSnapshot> {
    Json(ctx.snapshot_rx.borrow().clone())
}

pub async fn host_game(State(ctx): State<ServiceContext>) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::Host).await
}

#[derive(Deserialize)]
pub struct JoinRequest {
    pub host_address: String,
    pub mode: JoinMode,
    #[serde(default)]
    pub media: JoinMedia,
}

pub async fn join_game(
    State(ctx): State<ServiceContext>,
    Json(body): Json<JoinRequest>,
) -> ApiResult<serde_json::Value> {
    if body.host_address.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "host_address is required".to_string()));
    }
    run(
        &ctx,
        GameCommand::Join {
            host_address: body.host_address.trim().to_string(),
            mode: body.mode,
            media: body.media,
        },
    )
    .await
}

pub async fn cancel_join(State(ctx): State<ServiceContext>) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::CancelJoin).await
}

pub async fn leave_game(State(ctx): State<ServiceContext>) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::Leave).await
}

pub async fn end_game(State(ctx): State<ServiceContext>) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::EndGame).await
}

pub async fn next_round(State(ctx): State<ServiceContext>) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::NextRound).await
}

pub async fn toggle_timer(State(ctx): State<ServiceContext>) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::ToggleTimer).await
}

pub async fn add_time(State(ctx): State<ServiceContext>) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::AddTime).await
}

pub async fn revive_all(State(ctx): State<ServiceContext>) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::ReviveAll).await
}

// --- Contestant actions ---
// Credit checks for paid actions happen before these are called.

pub async fn pop_contestant(
    State(ctx): State<ServiceContext>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::Pop { id }).await
}

pub async fn revive_contestant(
    State(ctx): State<ServiceContext>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::Revive { id }).await
}

pub async fn grant_immunity(
    State(ctx): State<ServiceContext>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::GrantImmunity { id }).await
}

pub async fn super_like(
    State(ctx): State<ServiceContext>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::SuperLike { id }).await
}

pub async fn send_gift(
    State(ctx): State<ServiceContext>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::Gift { id }).await
}

// --- Chat ---

pub async fn get_chat(State(ctx): State<ServiceContext>) -> Json<Vec<ChatEntry>> {
    Json(ctx.snapshot_rx.borrow().chat.clone())
}

#[derive(Deserialize)]
pub struct ChatRequest {
    pub sender: String,
    pub text: String,
}

pub async fn send_chat(
    State(ctx): State<ServiceContext>,
    Json(body): Json<ChatRequest>,
) -> ApiResult<serde_json::Value> {
    if body.text.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "text is required".to_string()));
    }
    run(
        &ctx,
        GameCommand::SendChat {
            sender: body.sender,
            text: body.text,
        },
    )
    .await
}
