use serde::Serialize;
use tokio::sync::broadcast;

use crate::game::controller::{ChatEntry, ContestantCard};
use crate::game::timer::TimerView;
use crate::mesh::media::StreamInfo;

/// Game events for the presentation layer.
/// Emitted by the game engine, consumed by the WebSocket API and bots.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum GameEvent {
    Ready { address: String },
    // Host board
    ParticipantJoined(ContestantCard),
    ParticipantStreamChanged { id: String, stream: Option<StreamInfo> },
    ParticipantLeft { id: String, reason: String },
    ParticipantEliminated { id: String },
    ParticipantRevived { id: String },
    RoundTimerStarted { round: u32, timer: TimerView },
    /// Informational only; nobody is eliminated.
    TimerExpired { round: u32 },
    // Joiner view
    HostStreamReady(StreamInfo),
    HostDisconnected { reason: String },
    LobbyFull,
    // Both roles
    MediaChanged(Option<StreamInfo>),
    ChatMessage(ChatEntry),
    GameEnded { reason: String },
    Error { kind: String, message: String },
}

pub type EventSender = broadcast::Sender<GameEvent>;
pub type EventReceiver = broadcast::Receiver<GameEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}
