use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{MeshError, Result};
use crate::events::EventSender;
use crate::game::controller::{GameController, GameSnapshot, RoundAdvance};
use crate::game::effects::EffectsPlayer;
use crate::mesh::coordinator::{MeshCoordinator, MeshInput, SessionRole};
use crate::mesh::media::CaptureDevices;
use crate::mesh::signaling::EndpointFactory;
use crate::mesh::{JoinMedia, JoinMode, MeshEvent};

/// Commands sent to the game engine from the API, the CLI and bots.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum GameCommand {
    Host,
    Join {
        host_address: String,
        mode: JoinMode,
        #[serde(default)]
        media: JoinMedia,
    },
    CancelJoin,
    Leave,
    EndGame,
    Pop { id: String },
    Revive { id: String },
    ReviveAll,
    GrantImmunity { id: String },
    SuperLike { id: String },
    Gift { id: String },
    ToggleTimer,
    AddTime,
    NextRound,
    SetMuted { muted: bool },
    SetVideoEnabled { enabled: bool },
    StartScreenShare,
    StopScreenShare,
    SendChat { sender: String, text: String },
}

pub struct GameRequest {
    pub command: GameCommand,
    pub reply: oneshot::Sender<Result<()>>,
}

/// Handle for sending commands to the game engine.
#[derive(Clone)]
pub struct GameHandle {
    command_tx: mpsc::Sender<GameRequest>,
}

impl GameHandle {
    pub fn new(command_tx: mpsc::Sender<GameRequest>) -> Self {
        Self { command_tx }
    }

    /// Run a command on the engine and wait for its outcome.
    pub async fn send(&self, command: GameCommand) -> Result<()> {
        let (reply, outcome) = oneshot::channel();
        self.command_tx
            .send(GameRequest { command, reply })
            .await
            .map_err(|_| MeshError::EngineStopped)?;
        outcome.await.map_err(|_| MeshError::EngineStopped)?
    }
}

/// Pluggable collaborators of the engine.
#[derive(Clone)]
pub struct EngineBackend {
    pub endpoints: Arc<dyn EndpointFactory>,
    pub devices: Arc<dyn CaptureDevices>,
    pub effects: Arc<dyn EffectsPlayer>,
}

/// A running mesh session with its own event queue, so nothing from an
/// earlier game leaks into the next one.
struct LiveSession {
    mesh: MeshCoordinator,
    events: mpsc::UnboundedReceiver<MeshEvent>,
}

struct GameEngine {
    backend: EngineBackend,
    config: EngineConfig,
    controller: GameController,
    session: Option<LiveSession>,
    event_tx: EventSender,
    snapshot_tx: watch::Sender<GameSnapshot>,
}

/// Run the game engine event loop.
/// This owns the mesh coordinator and the role controller; every state
/// change happens on this task, in arrival order.
pub async fn run_game_engine(
    mut cmd_rx: mpsc::Receiver<GameRequest>,
    event_tx: EventSender,
    snapshot_tx: watch::Sender<GameSnapshot>,
    backend: EngineBackend,
    config: EngineConfig,
) {
    info!("Game engine started");

    let mut ticker = tokio::time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut engine = GameEngine {
        controller: GameController::new(&config, backend.effects.clone()),
        backend,
        config,
        session: None,
        event_tx,
        snapshot_tx,
    };

    loop {
        tokio::select! {
            request = cmd_rx.recv() => {
                let Some(GameRequest { command, reply }) = request else {
                    break;
                };
                debug!("Game command: {:?}", command);
                let result = engine.execute(command).await;
                if let Err(e) = &result {
                    debug!("Command failed: {}", e);
                }
                let _ = reply.send(result);
            }
            input = next_mesh_input(&mut engine.session) => {
                if let Some(session) = engine.session.as_mut() {
                    session.mesh.process(input).await;
                }
            }
            _ = ticker.tick() => engine.on_tick(),
        }
        engine.flush().await;
    }

    engine.close_session("engine stopped").await;
    engine.flush().await;
    info!("Game engine stopped");
}

async fn next_mesh_input(session: &mut Option<LiveSession>) -> MeshInput {
    match session {
        Some(session) => session.mesh.next_input().await,
        None => std::future::pending().await,
    }
}

impl GameEngine {
    async fn execute(&mut self, command: GameCommand) -> Result<()> {
        match command {
            GameCommand::Host => self.start_hosting().await,
            GameCommand::Join {
                host_address,
                mode,
                media,
            } => self.start_joining(&host_address, mode, media).await,
            GameCommand::CancelJoin => {
                self.mesh()?.cancel_join()?;
                self.close_session("join cancelled").await;
                Ok(())
            }
            GameCommand::Leave => {
                if self.session.is_none() && self.controller.is_idle() {
                    return Err(MeshError::NotInSession);
                }
                self.close_session("left the game").await;
                Ok(())
            }
            GameCommand::EndGame => {
                if !self.controller.is_host() {
                    return Err(MeshError::WrongRole("joiner"));
                }
                self.close_session("host ended the game").await;
                Ok(())
            }
            GameCommand::Pop { id } => {
                let session = self.session.as_mut().ok_or(MeshError::NotInSession)?;
                self.controller.pop(&mut session.mesh, &id)
            }
            GameCommand::Revive { id } => {
                let session = self.session.as_mut().ok_or(MeshError::NotInSession)?;
                self.controller.revive(&mut session.mesh, &id)
            }
            GameCommand::ReviveAll => {
                let session = self.session.as_mut().ok_or(MeshError::NotInSession)?;
                let revived = self.controller.revive_all(&mut session.mesh)?;
                info!("Revived {} contestants", revived);
                Ok(())
            }
            GameCommand::GrantImmunity { id } => self.controller.grant_immunity(&id),
            GameCommand::SuperLike { id } => self.controller.super_like(&id),
            GameCommand::Gift { id } => self.controller.gift(&id),
            GameCommand::ToggleTimer => self.controller.toggle_timer(),
            GameCommand::AddTime => self.controller.add_time(),
            GameCommand::NextRound => match self.controller.next_round()? {
                RoundAdvance::Started(_) => Ok(()),
                RoundAdvance::GameOver => {
                    self.close_session("final round finished").await;
                    Ok(())
                }
            },
            GameCommand::SetMuted { muted } => {
                self.mesh()?.set_muted(muted);
                Ok(())
            }
            GameCommand::SetVideoEnabled { enabled } => {
                self.mesh()?.set_video_enabled(enabled);
                Ok(())
            }
            GameCommand::StartScreenShare => {
                self.mesh()?.acquire_screen_share().await?;
                Ok(())
            }
            GameCommand::StopScreenShare => {
                let mesh = self.mesh()?;
                if !mesh.media().is_screen_sharing() {
                    return Ok(());
                }
                mesh.acquire_camera().await?;
                Ok(())
            }
            GameCommand::SendChat { sender, text } => self.controller.post_chat(&sender, &text),
        }
    }

    async fn start_hosting(&mut self) -> Result<()> {
        self.ensure_idle()?;
        self.controller.begin_host();
        let attempts = self.config.open_attempts;
        let delay = self.config.open_retry_delay;
        let session = self.open_session(SessionRole::Host);
        let started = session.mesh.start_hosting(attempts, delay).await;
        match started {
            Ok(address) => {
                info!("Hosting at {}", address);
                Ok(())
            }
            Err(e) => self.abort_start(e).await,
        }
    }

    async fn start_joining(&mut self, host_address: &str, mode: JoinMode, media: JoinMedia) -> Result<()> {
        self.ensure_idle()?;
        self.controller.begin_join(mode, host_address);
        let attempts = self.config.open_attempts;
        let delay = self.config.open_retry_delay;
        let session = self.open_session(SessionRole::Joiner(mode));
        let started = session
            .mesh
            .start_joining(host_address, media, attempts, delay)
            .await;
        match started {
            Ok(()) => Ok(()),
            Err(e) => self.abort_start(e).await,
        }
    }

    fn open_session(&mut self, role: SessionRole) -> &mut LiveSession {
        let (tx, events) = mpsc::unbounded_channel();
        let mesh = MeshCoordinator::new(
            role,
            self.backend.endpoints.create(),
            self.backend.devices.clone(),
            tx,
        );
        self.session.insert(LiveSession { mesh, events })
    }

    /// A failed start leaves nothing behind: media released, identity
    /// dropped, controller back to idle.
    async fn abort_start(&mut self, error: MeshError) -> Result<()> {
        warn!("Could not start game: {}", error);
        if let Some(mut session) = self.session.take() {
            session.mesh.shutdown().await;
        }
        self.controller.reset();
        self.controller.report(&error);
        Err(error)
    }

    async fn close_session(&mut self, reason: &str) {
        self.drop_session().await;
        self.controller.end(reason);
    }

    async fn drop_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            while let Ok(event) = session.events.try_recv() {
                self.controller.apply(event);
            }
            session.mesh.shutdown().await;
            self.controller.apply(MeshEvent::LocalMediaChanged(None));
        }
    }

    fn on_tick(&mut self) {
        self.controller.tick();
        if let (Some(timeout), Some(session)) = (self.config.connect_timeout, self.session.as_mut()) {
            session.mesh.expire_connecting(timeout);
        }
    }

    /// Feed queued mesh events to the controller, then publish.
    async fn flush(&mut self) {
        let mut host_lost = false;
        if let Some(session) = self.session.as_mut() {
            while let Ok(event) = session.events.try_recv() {
                host_lost |= matches!(event, MeshEvent::HostDisconnected(_));
                self.controller.apply(event);
            }
        }
        if host_lost {
            // no reconnect; the joined view keeps the disconnected flag
            self.drop_session().await;
        }

        for event in self.controller.take_events() {
            let _ = self.event_tx.send(event);
        }
        let snapshot = self.controller.snapshot();
        self.snapshot_tx.send_replace(snapshot);
    }

    fn mesh(&mut self) -> Result<&mut MeshCoordinator> {
        self.session
            .as_mut()
            .map(|s| &mut s.mesh)
            .ok_or(MeshError::NotInSession)
    }

    fn ensure_idle(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(MeshError::InvalidTransition("already in a game".to_string()));
        }
        // a joiner whose host went away is still looking at the old view
        self.controller.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events::{create_event_bus, GameEvent};
    use crate::game::controller::ViewSnapshot;
    use crate::game::effects::LogEffects;
    use crate::mesh::loopback::LoopbackBroker;
    use crate::mesh::media::SyntheticDevices;

    struct Harness {
        game: GameHandle,
        snapshots: watch::Receiver<GameSnapshot>,
    }

    fn spawn(broker: &LoopbackBroker) -> Harness {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, _) = create_event_bus();
        let (snapshot_tx, snapshots) = watch::channel(GameSnapshot::default());
        let backend = EngineBackend {
            endpoints: Arc::new(broker.clone()),
            devices: Arc::new(SyntheticDevices),
            effects: Arc::new(LogEffects),
        };
        let config = EngineConfig {
            open_retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        tokio::spawn(run_game_engine(command_rx, event_tx, snapshot_tx, backend, config));
        Harness {
            game: GameHandle::new(command_tx),
            snapshots,
        }
    }

    async fn wait_for(
        snapshots: &mut watch::Receiver<GameSnapshot>,
        what: impl FnMut(&GameSnapshot) -> bool,
    ) -> GameSnapshot {
        tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(what))
            .await
            .expect("snapshot in time")
            .expect("engine alive")
            .clone()
    }

    fn contestants(snapshot: &GameSnapshot) -> usize {
        match &snapshot.view {
            ViewSnapshot::Host { contestants, .. } => contestants.len(),
            _ => 0,
        }
    }

    #[tokio::test]
    async fn stop_share_on_camera_keeps_the_camera() {
        use crate::mesh::media::StreamSource;

        let broker = LoopbackBroker::new();
        let mut host = spawn(&broker);
        host.game.send(GameCommand::Host).await.unwrap();
        let camera = wait_for(&mut host.snapshots, |s| s.local_media.is_some())
            .await
            .local_media
            .unwrap();

        host.game.send(GameCommand::StopScreenShare).await.unwrap();
        host.game.send(GameCommand::SetMuted { muted: true }).await.unwrap();
        let muted = wait_for(&mut host.snapshots, |s| {
            s.local_media.as_ref().is_some_and(|m| !m.audio_enabled)
        })
        .await
        .local_media
        .unwrap();
        assert_eq!(muted.id, camera.id);

        host.game.send(GameCommand::StartScreenShare).await.unwrap();
        host.game.send(GameCommand::StopScreenShare).await.unwrap();
        let back = wait_for(&mut host.snapshots, |s| {
            s.local_media
                .as_ref()
                .is_some_and(|m| m.source == StreamSource::Camera && m.id != camera.id)
        })
        .await
        .local_media
        .unwrap();
        assert!(back.live);
    }

    #[tokio::test]
    async fn host_and_join_through_engines() {
        let broker = LoopbackBroker::new();
        let mut host = spawn(&broker);
        host.game.send(GameCommand::Host).await.unwrap();
        let address = wait_for(&mut host.snapshots, |s| s.address.is_some())
            .await
            .address
            .unwrap();

        let mut guest = spawn(&broker);
        guest
            .game
            .send(GameCommand::Join {
                host_address: address,
                mode: JoinMode::Contestant,
                media: JoinMedia::Camera,
            })
            .await
            .unwrap();

        wait_for(&mut host.snapshots, |s| contestants(s) == 1).await;
        let joined = wait_for(&mut guest.snapshots, |s| {
            matches!(s.view, ViewSnapshot::Joined { connected: true, .. })
        })
        .await;
        assert!(joined.local_media.is_some());

        host.game.send(GameCommand::EndGame).await.unwrap();
        let view = wait_for(&mut guest.snapshots, |s| {
            matches!(s.view, ViewSnapshot::Joined { connected: false, last_error: Some(_), .. })
        })
        .await;
        assert!(view.local_media.is_none() || !view.local_media.unwrap().live);
        assert_eq!(broker.calls_placed(), 1);
    }

    #[tokio::test]
    async fn second_host_command_is_refused() {
        let broker = LoopbackBroker::new();
        let harness = spawn(&broker);
        harness.game.send(GameCommand::Host).await.unwrap();
        assert!(matches!(
            harness.game.send(GameCommand::Host).await,
            Err(MeshError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_rendezvous_leaves_engine_idle() {
        let broker = LoopbackBroker::new();
        broker.set_reachable(false);
        let mut harness = spawn(&broker);

        let err = harness.game.send(GameCommand::Host).await.unwrap_err();
        assert!(matches!(err, MeshError::SignalingUnavailable(_)));
        let snapshot = wait_for(&mut harness.snapshots, |_| true).await;
        assert!(matches!(snapshot.view, ViewSnapshot::Idle));
        assert!(snapshot.local_media.is_none());
    }

    #[tokio::test]
    async fn host_actions_need_a_game() {
        let broker = LoopbackBroker::new();
        let harness = spawn(&broker);
        assert_eq!(
            harness.game.send(GameCommand::Pop { id: "x".into() }).await,
            Err(MeshError::NotInSession)
        );
        assert_eq!(
            harness.game.send(GameCommand::Leave).await,
            Err(MeshError::NotInSession)
        );
    }

    #[tokio::test]
    async fn errors_reach_the_event_bus() {
        let broker = LoopbackBroker::new();
        broker.set_reachable(false);
        let (command_tx, command_rx) = mpsc::channel(16);
        let (event_tx, mut event_rx) = create_event_bus();
        let (snapshot_tx, _snapshots) = watch::channel(GameSnapshot::default());
        let backend = EngineBackend {
            endpoints: Arc::new(broker.clone()),
            devices: Arc::new(SyntheticDevices),
            effects: Arc::new(LogEffects),
        };
        let config = EngineConfig {
            open_attempts: 1,
            ..Default::default()
        };
        tokio::spawn(run_game_engine(command_rx, event_tx, snapshot_tx, backend, config));
        let game = GameHandle::new(command_tx);

        assert!(game.send(GameCommand::Host).await.is_err());
        let kind = loop {
            match event_rx.recv().await.unwrap() {
                GameEvent::Error { kind, .. } => break kind,
                _ => continue,
            }
        };
        assert_eq!(kind, "SIGNALING_UNAVAILABLE");
    }

    #[tokio::test]
    async fn stopped_engine_is_reported() {
        let (command_tx, command_rx) = mpsc::channel(1);
        drop(command_rx);
        let game = GameHandle::new(command_tx);
        assert_eq!(game.send(GameCommand::Host).await, Err(MeshError::EngineStopped));
    }
}
