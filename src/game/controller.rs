use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{MeshError, Result};
use crate::events::GameEvent;
use crate::game::effects::{EffectsPlayer, SoundEffect};
use crate::game::timer::{RoundTimer, TimerView};
use crate::mesh::coordinator::MeshCoordinator;
use crate::mesh::media::StreamInfo;
use crate::mesh::{JoinMode, LifecycleState, MeshEvent};

/// One contestant tile on the host board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContestantCard {
    pub id: String,
    pub label: String,
    pub state: LifecycleState,
    pub stream: Option<StreamInfo>,
    pub joined_at: Option<DateTime<Utc>>,
    pub immune: bool,
    pub super_likes: u32,
    pub gifts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatEntry {
    pub id: String,
    pub sender: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug)]
struct HostBoard {
    contestants: Vec<ContestantCard>,
    timer: RoundTimer,
    round: u32,
    joined_total: u32,
}

#[derive(Debug)]
struct JoinedView {
    mode: JoinMode,
    host_address: String,
    host_stream: Option<StreamInfo>,
    connected: bool,
    last_error: Option<String>,
}

#[derive(Debug)]
enum RoleView {
    Idle,
    Host(HostBoard),
    Joined(JoinedView),
}

/// Read model published after every engine step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GameSnapshot {
    pub address: Option<String>,
    pub local_media: Option<StreamInfo>,
    pub view: ViewSnapshot,
    pub chat: Vec<ChatEntry>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(tag = "role", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewSnapshot {
    #[default]
    Idle,
    Host {
        round: u32,
        rounds_per_game: u32,
        timer: TimerView,
        active_count: usize,
        contestants: Vec<ContestantCard>,
    },
    /// Contestants and spectators see only the host.
    Joined {
        mode: JoinMode,
        host_address: String,
        host_stream: Option<StreamInfo>,
        connected: bool,
        last_error: Option<String>,
    },
}

/// What `next_round` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundAdvance {
    Started(u32),
    GameOver,
}

/// Turns mesh events into the role's view model and applies host actions.
///
/// Produced `GameEvent`s are queued and collected with `take_events`.
pub struct GameController {
    round_length: Duration,
    extend_step: Duration,
    rounds_per_game: u32,
    chat_limit: usize,
    effects: Arc<dyn EffectsPlayer>,
    view: RoleView,
    address: Option<String>,
    local_media: Option<StreamInfo>,
    chat: VecDeque<ChatEntry>,
    outbox: Vec<GameEvent>,
}

impl GameController {
    pub fn new(config: &EngineConfig, effects: Arc<dyn EffectsPlayer>) -> Self {
        Self {
            round_length: config.round_length,
            extend_step: config.extend_step,
            rounds_per_game: config.rounds_per_game.max(1),
            chat_limit: config.chat_history.max(1),
            effects,
            view: RoleView::Idle,
            address: None,
            local_media: None,
            chat: VecDeque::new(),
            outbox: Vec::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.view, RoleView::Idle)
    }

    pub fn is_host(&self) -> bool {
        matches!(self.view, RoleView::Host(_))
    }

    pub fn begin_host(&mut self) {
        self.reset();
        self.view = RoleView::Host(HostBoard {
            contestants: Vec::new(),
            timer: RoundTimer::new(self.round_length),
            round: 1,
            joined_total: 0,
        });
    }

    pub fn begin_join(&mut self, mode: JoinMode, host_address: &str) {
        self.reset();
        self.view = RoleView::Joined(JoinedView {
            mode,
            host_address: host_address.to_string(),
            host_stream: None,
            connected: false,
            last_error: None,
        });
    }

    /// Back to the menu.
    pub fn end(&mut self, reason: &str) {
        if self.is_idle() {
            return;
        }
        if self.is_host() {
            self.effects.play(SoundEffect::GameOver);
        }
        info!("Game ended: {}", reason);
        self.reset();
        self.outbox.push(GameEvent::GameEnded {
            reason: reason.to_string(),
        });
    }

    /// Drop all view state without announcing anything.
    pub fn reset(&mut self) {
        self.view = RoleView::Idle;
        self.address = None;
        self.local_media = None;
        self.chat.clear();
    }

    pub fn take_events(&mut self) -> Vec<GameEvent> {
        std::mem::take(&mut self.outbox)
    }

    pub fn apply(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::Ready { address } => {
                self.address = Some(address.clone());
                self.outbox.push(GameEvent::Ready { address });
            }
            MeshEvent::ParticipantJoined(info) => {
                let RoleView::Host(board) = &mut self.view else {
                    return;
                };
                board.joined_total += 1;
                let card = ContestantCard {
                    id: info.id,
                    label: format!("Contestant {}", board.joined_total),
                    state: info.state,
                    stream: info.stream,
                    joined_at: info.joined_at,
                    immune: false,
                    super_likes: 0,
                    gifts: 0,
                };
                board.contestants.push(card.clone());
                self.effects.play(SoundEffect::Join);
                self.outbox.push(GameEvent::ParticipantJoined(card));
            }
            MeshEvent::ParticipantStreamChanged(info) => {
                let Ok(card) = self.card_mut(&info.id) else {
                    return;
                };
                card.stream = info.stream.clone();
                self.outbox.push(GameEvent::ParticipantStreamChanged {
                    id: info.id,
                    stream: info.stream,
                });
            }
            MeshEvent::StartRoundTimer => {
                let RoleView::Host(board) = &mut self.view else {
                    return;
                };
                board.timer.start();
                self.outbox.push(GameEvent::RoundTimerStarted {
                    round: board.round,
                    timer: board.timer.view(),
                });
            }
            MeshEvent::ParticipantLeft { info, reason } => {
                if let RoleView::Host(board) = &mut self.view {
                    board.contestants.retain(|c| c.id != info.id);
                }
                self.outbox.push(GameEvent::ParticipantLeft { id: info.id, reason });
            }
            MeshEvent::ParticipantEliminated { id } => {
                self.set_card_state(&id, LifecycleState::Eliminated);
                self.outbox.push(GameEvent::ParticipantEliminated { id });
            }
            MeshEvent::ParticipantRevived { id } => {
                self.set_card_state(&id, LifecycleState::Active);
                self.outbox.push(GameEvent::ParticipantRevived { id });
            }
            MeshEvent::HostStreamReady(stream) => {
                if let RoleView::Joined(view) = &mut self.view {
                    // later streams are the host switching source
                    if !view.connected {
                        self.effects.play(SoundEffect::Join);
                    }
                    view.host_stream = Some(stream.clone());
                    view.connected = true;
                }
                self.outbox.push(GameEvent::HostStreamReady(stream));
            }
            MeshEvent::HostDisconnected(error) => {
                if let RoleView::Joined(view) = &mut self.view {
                    view.host_stream = None;
                    view.connected = false;
                    view.last_error = Some(error.to_string());
                }
                if error == MeshError::SessionRejected {
                    self.outbox.push(GameEvent::LobbyFull);
                }
                self.outbox.push(GameEvent::HostDisconnected {
                    reason: error.to_string(),
                });
            }
            MeshEvent::LocalMediaChanged(stream) => {
                self.local_media = stream.clone();
                self.outbox.push(GameEvent::MediaChanged(stream));
            }
            MeshEvent::Error(error) => self.report(&error),
        }
    }

    /// Put an error on the bus.
    pub fn report(&mut self, error: &MeshError) {
        self.outbox.push(GameEvent::Error {
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
    }

    /// Eliminate a contestant. Immune contestants are refused. A pop puts
    /// a full round back on the clock without starting or pausing it.
    pub fn pop(&mut self, mesh: &mut MeshCoordinator, id: &str) -> Result<()> {
        let board = self.board_mut()?;
        let card = board
            .contestants
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| MeshError::UnknownParticipant(id.to_string()))?;
        if card.immune {
            return Err(MeshError::Immune(id.to_string()));
        }
        mesh.eliminate(id)?;
        board.timer.reset();
        self.effects.play(SoundEffect::Pop);
        Ok(())
    }

    pub fn revive(&mut self, mesh: &mut MeshCoordinator, id: &str) -> Result<()> {
        self.board_mut()?;
        mesh.revive(id)
    }

    /// Returns how many contestants came back.
    pub fn revive_all(&mut self, mesh: &mut MeshCoordinator) -> Result<usize> {
        let eliminated: Vec<String> = self
            .board_mut()?
            .contestants
            .iter()
            .filter(|c| c.state == LifecycleState::Eliminated)
            .map(|c| c.id.clone())
            .collect();
        let mut revived = 0;
        for id in eliminated {
            match mesh.revive(&id) {
                Ok(()) => revived += 1,
                Err(e) => warn!("Could not revive {}: {}", id, e),
            }
        }
        Ok(revived)
    }

    pub fn grant_immunity(&mut self, id: &str) -> Result<()> {
        self.card_mut(id)?.immune = true;
        info!("{} is immune", id);
        Ok(())
    }

    pub fn super_like(&mut self, id: &str) -> Result<()> {
        self.card_mut(id)?.super_likes += 1;
        Ok(())
    }

    pub fn gift(&mut self, id: &str) -> Result<()> {
        self.card_mut(id)?.gifts += 1;
        Ok(())
    }

    pub fn toggle_timer(&mut self) -> Result<()> {
        let board = self.board_mut()?;
        board.timer.toggle();
        debug!("Round timer running={}", board.timer.is_running());
        Ok(())
    }

    pub fn add_time(&mut self) -> Result<()> {
        let step = self.extend_step;
        self.board_mut()?.timer.extend(step);
        Ok(())
    }

    /// Start the next round, or report that the last one is done.
    pub fn next_round(&mut self) -> Result<RoundAdvance> {
        let rounds_per_game = self.rounds_per_game;
        let board = self.board_mut()?;
        if board.round >= rounds_per_game {
            return Ok(RoundAdvance::GameOver);
        }
        board.round += 1;
        board.timer.reset();
        board.timer.start();
        let (round, timer) = (board.round, board.timer.view());
        info!("Round {} started", round);
        self.outbox.push(GameEvent::RoundTimerStarted { round, timer });
        Ok(RoundAdvance::Started(round))
    }

    /// One second of game time.
    pub fn tick(&mut self) {
        let RoleView::Host(board) = &mut self.view else {
            return;
        };
        if board.timer.tick() {
            info!("Round {} timer expired", board.round);
            self.outbox.push(GameEvent::TimerExpired { round: board.round });
        }
    }

    pub fn post_chat(&mut self, sender: &str, text: &str) -> Result<()> {
        if self.is_idle() {
            return Err(MeshError::NotInSession);
        }
        let entry = ChatEntry {
            id: Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            text: text.to_string(),
            sent_at: Utc::now(),
        };
        if self.chat.len() == self.chat_limit {
            self.chat.pop_front();
        }
        self.chat.push_back(entry.clone());
        self.outbox.push(GameEvent::ChatMessage(entry));
        Ok(())
    }

    pub fn snapshot(&self) -> GameSnapshot {
        let view = match &self.view {
            RoleView::Idle => ViewSnapshot::Idle,
            RoleView::Host(board) => ViewSnapshot::Host {
                round: board.round,
                rounds_per_game: self.rounds_per_game,
                timer: board.timer.view(),
                active_count: board
                    .contestants
                    .iter()
                    .filter(|c| c.state == LifecycleState::Active)
                    .count(),
                contestants: board.contestants.clone(),
            },
            RoleView::Joined(view) => ViewSnapshot::Joined {
                mode: view.mode,
                host_address: view.host_address.clone(),
                host_stream: view.host_stream.clone(),
                connected: view.connected,
                last_error: view.last_error.clone(),
            },
        };
        GameSnapshot {
            address: self.address.clone(),
            local_media: self.local_media.clone(),
            view,
            chat: self.chat.iter().cloned().collect(),
        }
    }

    fn board_mut(&mut self) -> Result<&mut HostBoard> {
        match &mut self.view {
            RoleView::Host(board) => Ok(board),
            RoleView::Joined(view) => Err(MeshError::WrongRole(match view.mode {
                JoinMode::Contestant => "contestant",
                JoinMode::Spectator => "spectator",
            })),
            RoleView::Idle => Err(MeshError::NotInSession),
        }
    }

    fn card_mut(&mut self, id: &str) -> Result<&mut ContestantCard> {
        self.board_mut()?
            .contestants
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| MeshError::UnknownParticipant(id.to_string()))
    }

    fn set_card_state(&mut self, id: &str, state: LifecycleState) {
        if let Ok(card) = self.card_mut(id) {
            card.state = state;
        }
    }
}
