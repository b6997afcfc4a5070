pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod game;
pub mod mesh;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::create_event_bus;
use crate::game::bots::{spawn_bot, BotHandle};
use crate::game::controller::{GameSnapshot, ViewSnapshot};
use crate::game::effects::LogEffects;
use crate::game::{EngineBackend, GameCommand, GameHandle, GameRequest};
use crate::mesh::loopback::LoopbackBroker;
use crate::mesh::media::SyntheticDevices;
use crate::state::ServiceContext;

/// `RUST_LOG` wins; otherwise `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// In-process backend: loopback rendezvous and synthetic capture.
pub fn loopback_backend(broker: &LoopbackBroker) -> EngineBackend {
    EngineBackend {
        endpoints: Arc::new(broker.clone()),
        devices: Arc::new(SyntheticDevices),
        effects: Arc::new(LogEffects),
    }
}

/// Create the channels and spawn the game engine task.
pub fn spawn_game_engine(backend: EngineBackend, config: EngineConfig) -> ServiceContext {
    let (command_tx, command_rx) = mpsc::channel::<GameRequest>(64);
    let (event_tx, _event_rx) = create_event_bus();
    let (snapshot_tx, snapshot_rx) = watch::channel(GameSnapshot::default());

    let engine_event_tx = event_tx.clone();
    tokio::spawn(async move {
        game::run_game_engine(command_rx, engine_event_tx, snapshot_tx, backend, config).await;
    });

    ServiceContext {
        game: GameHandle::new(command_tx),
        event_tx,
        snapshot_rx,
    }
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub port: u16,
    /// Start hosting immediately instead of waiting for an API call.
    pub host: bool,
    pub bots: usize,
}

/// Run the engine behind the HTTP/WebSocket API.
pub async fn run_server(opts: ServeOptions, config: EngineConfig) -> std::io::Result<()> {
    let broker = LoopbackBroker::new();
    let ctx = spawn_game_engine(loopback_backend(&broker), config.clone());

    let mut bots = Vec::new();
    if opts.host {
        match host_and_wait(&ctx).await {
            Ok(address) => {
                info!("Share this address with joiners: {}", address);
                bots = spawn_bots(&broker, &address, opts.bots, &config);
            }
            Err(e) => warn!("Could not start hosting: {}", e),
        }
    } else if opts.bots > 0 {
        warn!("--bots needs --host; no bots started");
    }

    let served = api::server::start_api_server(ctx, opts.port).await;
    for bot in bots {
        bot.leave().await;
    }
    served
}

/// Scripted run: host a game, let bots fill the lobby (one more than fits),
/// pop a contestant, shield another, then end the game.
pub async fn run_demo(bot_count: usize, config: EngineConfig) -> Result<()> {
    let broker = LoopbackBroker::new();
    let ctx = spawn_game_engine(loopback_backend(&broker), config.clone());
    let mut snapshots = ctx.snapshot_rx.clone();

    let address = host_and_wait(&ctx).await?;
    let bots = spawn_bots(&broker, &address, bot_count, &config);

    let expected = bot_count.min(mesh::MAX_CONTESTANTS);
    let filled = tokio::time::timeout(
        Duration::from_secs(5),
        snapshots.wait_for(|s| contestant_ids(s).len() >= expected),
    )
    .await
    .is_ok();
    if !filled {
        warn!("Lobby did not fill in time");
    }

    let ids = contestant_ids(&ctx.snapshot_rx.borrow());
    info!("{} contestants on stage", ids.len());
    if let Some(first) = ids.first() {
        ctx.game.send(GameCommand::Pop { id: first.clone() }).await?;
    }
    if let Some(second) = ids.get(1) {
        ctx.game.send(GameCommand::GrantImmunity { id: second.clone() }).await?;
        ctx.game.send(GameCommand::SuperLike { id: second.clone() }).await?;
    }
    ctx.game
        .send(GameCommand::SendChat {
            sender: "host".to_string(),
            text: "Welcome to the stage!".to_string(),
        })
        .await?;

    let board = ctx.snapshot_rx.borrow().clone();
    match serde_json::to_string_pretty(&board) {
        Ok(json) => info!("Board:\n{}", json),
        Err(e) => warn!("Failed to serialize board: {}", e),
    }

    ctx.game.send(GameCommand::EndGame).await?;
    for bot in bots {
        bot.leave().await;
    }
    info!("Demo finished");
    Ok(())
}

async fn host_and_wait(ctx: &ServiceContext) -> Result<String> {
    ctx.game.send(GameCommand::Host).await?;
    let mut snapshots = ctx.snapshot_rx.clone();
    let snapshot = snapshots
        .wait_for(|s| s.address.is_some())
        .await
        .map_err(|_| error::MeshError::EngineStopped)?;
    let address = snapshot.address.clone();
    address.ok_or(error::MeshError::EngineStopped)
}

fn spawn_bots(
    broker: &LoopbackBroker,
    address: &str,
    count: usize,
    config: &EngineConfig,
) -> Vec<BotHandle> {
    (1..=count)
        .map(|n| {
            spawn_bot(
                format!("bot-{}", n),
                Arc::new(broker.clone()),
                Arc::new(SyntheticDevices),
                address,
                config,
            )
        })
        .collect()
}

fn contestant_ids(snapshot: &GameSnapshot) -> Vec<String> {
    match &snapshot.view {
        ViewSnapshot::Host { contestants, .. } => contestants.iter().map(|c| c.id.clone()).collect(),
        _ => Vec::new(),
    }
}
