use axum::{extract::State, Json};
use serde::Deserialize;

use crate::api::routes::game::{run, ApiResult};
use crate::game::GameCommand;
use crate::mesh::media::StreamInfo;
use crate::state::ServiceContext;

#[derive(Deserialize)]
pub struct SetMutedRequest {
    pub muted: bool,
}

pub async fn set_muted(
    State(ctx): State<ServiceContext>,
    Json(body): Json<SetMutedRequest>,
) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::SetMuted { muted: body.muted }).await
}

#[derive(Deserialize)]
pub struct SetVideoRequest {
    pub enabled: bool,
}

pub async fn set_video(
    State(ctx): State<ServiceContext>,
    Json(body): Json<SetVideoRequest>,
) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::SetVideoEnabled { enabled: body.enabled }).await
}

pub async fn start_screen_share(State(ctx): State<ServiceContext>) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::StartScreenShare).await
}

/// Switch back to the camera.
pub async fn stop_screen_share(State(ctx): State<ServiceContext>) -> ApiResult<serde_json::Value> {
    run(&ctx, GameCommand::StopScreenShare).await
}

pub async fn get_local_media(State(ctx): State<ServiceContext>) -> Json<Option<StreamInfo>> {
    Json(ctx.snapshot_rx.borrow().local_media.clone())
}
