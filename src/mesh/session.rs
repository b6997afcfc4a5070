use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::{MeshError, Result};
use crate::mesh::media::MediaStream;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one negotiated session. Never reused, even when the same
/// remote reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HandleId(u64);

impl HandleId {
    pub fn next() -> Self {
        Self(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Active,
    Closed,
    Errored(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored(_))
    }

    /// The only way a session changes state.
    ///
    /// `Pending -> Active` on the first remote stream; further streams keep
    /// it `Active` (source switch on the far side). `Rejected` is only valid
    /// while pending. `Closed`/`Errored` are terminal and accept nothing.
    pub fn transition(&self, signal: &SessionSignal) -> Result<SessionState> {
        use SessionState::*;
        match (self, signal) {
            (Pending | Active, SessionSignal::StreamReceived(_)) => Ok(Active),
            (Pending, SessionSignal::Rejected) => Ok(Closed),
            (Pending | Active, SessionSignal::Closed) => Ok(Closed),
            (Pending | Active, SessionSignal::Error(reason)) => Ok(Errored(reason.clone())),
            (state, signal) => Err(MeshError::InvalidTransition(format!(
                "{} while {:?}",
                signal.name(),
                state
            ))),
        }
    }
}

/// What the transport reports about a session.
#[derive(Debug, Clone)]
pub enum SessionSignal {
    StreamReceived(Arc<MediaStream>),
    /// The callee declined the offer (capacity).
    Rejected,
    Closed,
    Error(String),
}

impl SessionSignal {
    pub fn name(&self) -> &'static str {
        match self {
            SessionSignal::StreamReceived(_) => "stream-received",
            SessionSignal::Rejected => "rejected",
            SessionSignal::Closed => "closed",
            SessionSignal::Error(_) => "error",
        }
    }
}

/// A signal tagged with the handle it belongs to.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub handle: HandleId,
    pub remote: String,
    pub signal: SessionSignal,
}

/// The negotiated connection underneath a handle.
pub trait SessionTransport: Send {
    /// Hang up. Must not emit a signal back to the local side.
    fn close(&mut self);
    /// Swap the stream we send without renegotiating.
    fn replace_local_stream(&mut self, stream: Arc<MediaStream>);
}

pub struct SessionHandle {
    id: HandleId,
    remote: String,
    direction: Direction,
    state: SessionState,
    transport: Box<dyn SessionTransport>,
}

impl SessionHandle {
    pub fn new(
        id: HandleId,
        remote: impl Into<String>,
        direction: Direction,
        transport: Box<dyn SessionTransport>,
    ) -> Self {
        Self {
            id,
            remote: remote.into(),
            direction,
            state: SessionState::Pending,
            transport,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn apply(&mut self, signal: &SessionSignal) -> Result<&SessionState> {
        self.state = self.state.transition(signal)?;
        Ok(&self.state)
    }

    pub fn replace_local_stream(&mut self, stream: Arc<MediaStream>) {
        if !self.state.is_terminal() {
            self.transport.replace_local_stream(stream);
        }
    }

    pub fn close(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.transport.close();
        self.state = SessionState::Closed;
        debug!("Closed session {} to {}", self.id, self.remote);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .finish()
    }
}
