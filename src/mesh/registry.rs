use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{MeshError, Result};
use crate::mesh::media::MediaStream;
use crate::mesh::session::SessionHandle;

/// Live session handles keyed by remote identity.
///
/// Mutated only from the engine task, so no locking.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    handles: HashMap<String, SessionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A duplicate handle is dropped, which hangs it up.
    pub fn register(&mut self, remote_id: &str, handle: SessionHandle) -> Result<()> {
        if self.handles.contains_key(remote_id) {
            return Err(MeshError::DuplicateSession(remote_id.to_string()));
        }
        debug!("Registered session {} for {}", handle.id(), remote_id);
        self.handles.insert(remote_id.to_string(), handle);
        Ok(())
    }

    /// Close and forget the handle for `remote_id`, if any.
    pub fn unregister(&mut self, remote_id: &str) {
        if let Some(mut handle) = self.handles.remove(remote_id) {
            handle.close();
            debug!("Unregistered session {} for {}", handle.id(), remote_id);
        }
    }

    /// Remove without hanging up; for handles the remote already ended.
    pub fn take(&mut self, remote_id: &str) -> Option<SessionHandle> {
        self.handles.remove(remote_id)
    }

    pub fn count(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.handles.contains_key(remote_id)
    }

    pub fn get(&self, remote_id: &str) -> Option<&SessionHandle> {
        self.handles.get(remote_id)
    }

    pub fn get_mut(&mut self, remote_id: &str) -> Option<&mut SessionHandle> {
        self.handles.get_mut(remote_id)
    }

    /// Point every session at a new local stream.
    pub fn replace_local_stream(&mut self, stream: &Arc<MediaStream>) {
        for handle in self.handles.values_mut() {
            handle.replace_local_stream(stream.clone());
        }
    }

    pub fn close_all(&mut self) {
        for (remote_id, mut handle) in self.handles.drain() {
            handle.close();
            debug!("Closed session {} for {} during teardown", handle.id(), remote_id);
        }
    }
}
