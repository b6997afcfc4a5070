use std::net::SocketAddr;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{routes, websocket};
use crate::state::ServiceContext;

pub fn build_router(ctx: ServiceContext) -> Router {
    Router::new()
        // Game lifecycle
        .route("/api/v1/game", get(routes::game::get_game))
        .route("/api/v1/game/host", post(routes::game::host_game))
        .route("/api/v1/game/join", post(routes::game::join_game))
        .route("/api/v1/game/cancel-join", post(routes::game::cancel_join))
        .route("/api/v1/game/leave", post(routes::game::leave_game))
        .route("/api/v1/game/end", post(routes::game::end_game))
        // Host board
        .route("/api/v1/game/round/next", post(routes::game::next_round))
        .route("/api/v1/game/timer/toggle", post(routes::game::toggle_timer))
        .route("/api/v1/game/timer/add", post(routes::game::add_time))
        .route("/api/v1/game/revive-all", post(routes::game::revive_all))
        .route("/api/v1/game/contestants/:id/pop", post(routes::game::pop_contestant))
        .route("/api/v1/game/contestants/:id/revive", post(routes::game::revive_contestant))
        .route("/api/v1/game/contestants/:id/immunity", post(routes::game::grant_immunity))
        .route("/api/v1/game/contestants/:id/super-like", post(routes::game::super_like))
        .route("/api/v1/game/contestants/:id/gift", post(routes::game::send_gift))
        // Chat
        .route("/api/v1/game/chat", get(routes::game::get_chat).post(routes::game::send_chat))
        // Local media
        .route("/api/v1/media", get(routes::media::get_local_media))
        .route("/api/v1/media/muted", put(routes::media::set_muted))
        .route("/api/v1/media/video", put(routes::media::set_video))
        .route("/api/v1/media/screen/start", post(routes::media::start_screen_share))
        .route("/api/v1/media/screen/stop", post(routes::media::stop_screen_share))
        // WebSocket
        .route("/ws", get(websocket::ws_handler))
        // Middleware
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

pub async fn start_api_server(ctx: ServiceContext, port: u16) -> std::io::Result<()> {
    let router = build_router(ctx);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on http://{}", addr);
    axum::serve(listener, router).await
}
