pub mod coordinator;
pub mod loopback;
pub mod media;
pub mod registry;
pub mod session;
pub mod signaling;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::MeshError;
use media::{MediaStream, StreamInfo};
use session::HandleId;

/// Hard cap on simultaneous contestant sessions at a host.
pub const MAX_CONTESTANTS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Host,
    Contestant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Connecting,
    Active,
    /// Out of play; the session stays open.
    Eliminated,
    Disconnected,
}

/// Application-level record for one remote session at the host.
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: String,
    pub role: Role,
    pub state: LifecycleState,
    pub handle: HandleId,
    pub stream: Option<Arc<MediaStream>>,
    pub joined_at: Option<DateTime<Utc>>,
    pub(crate) connecting_since: Instant,
}

impl Participant {
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            role: self.role,
            state: self.state,
            handle: self.handle,
            stream: self.stream.as_ref().map(|s| s.info()),
            joined_at: self.joined_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantInfo {
    pub id: String,
    pub role: Role,
    pub state: LifecycleState,
    pub handle: HandleId,
    pub stream: Option<StreamInfo>,
    pub joined_at: Option<DateTime<Utc>>,
}

/// How a joining peer takes part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinMode {
    Contestant,
    Spectator,
}

/// Which local capture a joiner sends to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinMedia {
    #[default]
    Camera,
    /// Acquired only for this call; stopped if the call is cancelled.
    ScreenShare,
}

/// Lifecycle notifications from the coordinator to the role controller.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    Ready { address: String },
    ParticipantJoined(ParticipantInfo),
    /// First contestant of the session became active.
    StartRoundTimer,
    /// An active or eliminated contestant switched source.
    ParticipantStreamChanged(ParticipantInfo),
    ParticipantLeft { info: ParticipantInfo, reason: String },
    ParticipantEliminated { id: String },
    ParticipantRevived { id: String },
    HostStreamReady(StreamInfo),
    /// Fatal for a joiner. `SessionRejected` means the lobby was full.
    HostDisconnected(MeshError),
    LocalMediaChanged(Option<StreamInfo>),
    Error(MeshError),
}
