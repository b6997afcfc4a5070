use serde::Serialize;
use thiserror::Error;

/// Why a capture device could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceFailure {
    PermissionDenied,
    NoDevice,
    DeviceBusy,
}

/// Failures of the mesh session core and the game controller on top of it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshError {
    /// Local capture failed. `reason` is the device layer's message, verbatim.
    #[error("device unavailable ({kind:?}): {reason}")]
    DeviceUnavailable { kind: DeviceFailure, reason: String },

    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("session rejected: lobby full")]
    SessionRejected,

    #[error("remote disconnected: {0}")]
    RemoteDisconnected(String),

    #[error("duplicate session for {0}")]
    DuplicateSession(String),

    #[error("unknown participant {0}")]
    UnknownParticipant(String),

    #[error("participant {0} is immune")]
    Immune(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("no game session in progress")]
    NotInSession,

    #[error("operation not available to the {0} role")]
    WrongRole(&'static str),

    #[error("game engine is not running")]
    EngineStopped,
}

impl MeshError {
    /// Stable machine-readable kind, used on the event bus.
    pub fn kind(&self) -> &'static str {
        match self {
            MeshError::DeviceUnavailable { .. } => "DEVICE_UNAVAILABLE",
            MeshError::SignalingUnavailable(_) => "SIGNALING_UNAVAILABLE",
            MeshError::SessionRejected => "SESSION_REJECTED",
            MeshError::RemoteDisconnected(_) => "REMOTE_DISCONNECTED",
            MeshError::DuplicateSession(_) => "DUPLICATE_SESSION",
            MeshError::UnknownParticipant(_) => "UNKNOWN_PARTICIPANT",
            MeshError::Immune(_) => "IMMUNE",
            MeshError::InvalidTransition(_) => "INVALID_TRANSITION",
            MeshError::NotInSession => "NOT_IN_SESSION",
            MeshError::WrongRole(_) => "WRONG_ROLE",
            MeshError::EngineStopped => "ENGINE_STOPPED",
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_reason_is_surfaced_verbatim() {
        let err = MeshError::DeviceUnavailable {
            kind: DeviceFailure::PermissionDenied,
            reason: "NotAllowedError: Permission denied".to_string(),
        };
        assert!(err.to_string().contains("NotAllowedError: Permission denied"));
        assert_eq!(err.kind(), "DEVICE_UNAVAILABLE");
    }

    #[test]
    fn rejected_reads_as_lobby_full() {
        assert_eq!(MeshError::SessionRejected.to_string(), "session rejected: lobby full");
    }
}
