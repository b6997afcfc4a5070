use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{MeshError, Result};
use crate::mesh::media::{CaptureDevices, LocalMediaSource, MediaStream, StreamInfo};
use crate::mesh::registry::ConnectionRegistry;
use crate::mesh::session::{HandleId, SessionEvent, SessionSignal, SessionState};
use crate::mesh::signaling::{EndpointEvent, SessionOffer, SignalingEndpoint};
use crate::mesh::{
    JoinMedia, JoinMode, LifecycleState, MeshEvent, Participant, Role, MAX_CONTESTANTS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Host,
    Joiner(JoinMode),
}

impl SessionRole {
    fn name(&self) -> &'static str {
        match self {
            SessionRole::Host => "host",
            SessionRole::Joiner(JoinMode::Contestant) => "contestant",
            SessionRole::Joiner(JoinMode::Spectator) => "spectator",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostLinkState {
    Calling,
    Connected,
    Lost,
}

/// A joiner's single view of the host.
#[derive(Debug)]
struct HostLink {
    address: String,
    handle: HandleId,
    state: HostLinkState,
    stream: Option<Arc<MediaStream>>,
    since: Instant,
}

/// One unit of work for the coordinator, in arrival order.
#[derive(Debug)]
pub enum MeshInput {
    Endpoint(EndpointEvent),
    ScreenShareEnded,
}

/// Owns the signaling endpoint, the connection registry and the local media
/// for one game session, and turns endpoint traffic into `MeshEvent`s.
///
/// All methods run on the engine task. Capacity is checked when an offer is
/// processed, so near the limit the winner among simultaneous offers is
/// whichever the endpoint delivered first.
pub struct MeshCoordinator {
    role: SessionRole,
    endpoint: Box<dyn SignalingEndpoint>,
    endpoint_rx: mpsc::UnboundedReceiver<EndpointEvent>,
    registry: ConnectionRegistry,
    media: LocalMediaSource,
    participants: Vec<Participant>,
    host_link: Option<HostLink>,
    call_media_exclusive: bool,
    events: mpsc::UnboundedSender<MeshEvent>,
    address: Option<String>,
    shut_down: bool,
}

impl MeshCoordinator {
    pub fn new(
        role: SessionRole,
        mut endpoint: Box<dyn SignalingEndpoint>,
        devices: Arc<dyn CaptureDevices>,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Self {
        let (sink, endpoint_rx) = mpsc::unbounded_channel();
        endpoint.on_incoming_session(sink.clone());
        endpoint.on_session_event(sink);

        Self {
            role,
            endpoint,
            endpoint_rx,
            registry: ConnectionRegistry::new(),
            media: LocalMediaSource::new(devices),
            participants: Vec::new(),
            host_link: None,
            call_media_exclusive: false,
            events,
            address: None,
            shut_down: false,
        }
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn media(&self) -> &LocalMediaSource {
        &self.media
    }

    pub fn host_stream(&self) -> Option<&Arc<MediaStream>> {
        self.host_link.as_ref().and_then(|l| l.stream.as_ref())
    }

    pub fn host_link_state(&self) -> Option<HostLinkState> {
        self.host_link.as_ref().map(|l| l.state)
    }

    pub fn is_connected_to_host(&self) -> bool {
        self.host_link_state() == Some(HostLinkState::Connected)
    }

    /// Register with the rendezvous service, retrying a bounded number of
    /// times. Only called while a session is starting.
    pub async fn open(&mut self, attempts: u32, retry_delay: Duration) -> Result<String> {
        let attempts = attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.endpoint.open().await {
                Ok(address) => {
                    info!("Signaling ready as {} ({})", address, self.role.name());
                    self.address = Some(address.clone());
                    self.emit(MeshEvent::Ready {
                        address: address.clone(),
                    });
                    return Ok(address);
                }
                Err(e) => {
                    warn!("Signaling open attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| MeshError::SignalingUnavailable("no attempt made".to_string())))
    }

    /// Camera first, then identity: a host without a camera cannot host.
    pub async fn start_hosting(&mut self, attempts: u32, retry_delay: Duration) -> Result<String> {
        self.require_host()?;
        self.acquire_camera().await?;
        self.open(attempts, retry_delay).await
    }

    /// Acquire media, open our identity and call the host. A spectator whose
    /// camera is unavailable joins with a silent placeholder stream.
    pub async fn start_joining(
        &mut self,
        host_address: &str,
        media: JoinMedia,
        attempts: u32,
        retry_delay: Duration,
    ) -> Result<()> {
        let mode = self.require_joiner()?;
        match media {
            JoinMedia::Camera => match self.acquire_camera().await {
                Ok(_) => {}
                Err(e @ MeshError::DeviceUnavailable { .. }) if mode == JoinMode::Spectator => {
                    warn!("Camera unavailable, spectating without local media: {}", e);
                    self.emit(MeshEvent::Error(e));
                    let silent = self.media.use_silent();
                    self.emit(MeshEvent::LocalMediaChanged(Some(silent.info())));
                }
                Err(e) => return Err(e),
            },
            JoinMedia::ScreenShare => {
                self.acquire_screen_share().await?;
                self.call_media_exclusive = true;
            }
        }
        self.open(attempts, retry_delay).await?;
        self.join(host_address).await
    }

    /// Place the one outbound call of this join attempt.
    pub async fn join(&mut self, host_address: &str) -> Result<()> {
        self.require_joiner()?;
        if self.host_link.is_some() {
            return Err(MeshError::InvalidTransition(
                "host call already placed for this join attempt".to_string(),
            ));
        }
        let local = self
            .media
            .current()
            .cloned()
            .ok_or_else(|| MeshError::InvalidTransition("no local media to send".to_string()))?;

        let handle = self.endpoint.call(host_address, local).await?;
        let handle_id = handle.id();
        self.registry.register(host_address, handle)?;
        self.host_link = Some(HostLink {
            address: host_address.to_string(),
            handle: handle_id,
            state: HostLinkState::Calling,
            stream: None,
            since: Instant::now(),
        });
        info!("Calling host {} (session {})", host_address, handle_id);
        Ok(())
    }

    /// Abandon a call that has not connected yet. Media acquired only for
    /// this call is stopped immediately.
    pub fn cancel_join(&mut self) -> Result<()> {
        self.require_joiner()?;
        let calling = self
            .host_link
            .as_ref()
            .is_some_and(|l| l.state == HostLinkState::Calling);
        if !calling {
            return Err(MeshError::InvalidTransition("no pending host call".to_string()));
        }
        if let Some(link) = self.host_link.take() {
            self.registry.unregister(&link.address);
            info!("Cancelled pending call {} to {}", link.handle, link.address);
        }
        if self.call_media_exclusive {
            self.media.release();
            self.call_media_exclusive = false;
            self.emit(MeshEvent::LocalMediaChanged(None));
        }
        Ok(())
    }

    /// Whatever was live is stopped first, so a failure leaves no local
    /// stream; that is reported as `LocalMediaChanged(None)`.
    pub async fn acquire_camera(&mut self) -> Result<StreamInfo> {
        let had_stream = self.media.current().is_some();
        match self.media.acquire_camera().await {
            Ok(stream) => {
                self.call_media_exclusive = false;
                Ok(self.publish_local(&stream))
            }
            Err(e) => {
                if had_stream {
                    self.emit(MeshEvent::LocalMediaChanged(None));
                }
                Err(e)
            }
        }
    }

    pub async fn acquire_screen_share(&mut self) -> Result<StreamInfo> {
        let stream = self.media.acquire_screen_share().await?;
        Ok(self.publish_local(&stream))
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.media.set_muted(muted);
        self.emit_local_media();
    }

    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.media.set_video_enabled(enabled);
        self.emit_local_media();
    }

    /// Take an active contestant out of play. The session stays open.
    pub fn eliminate(&mut self, id: &str) -> Result<()> {
        self.require_host()?;
        let participant = self.participant_mut(id)?;
        if participant.state != LifecycleState::Active {
            return Err(MeshError::InvalidTransition(format!(
                "cannot eliminate {} while {:?}",
                id, participant.state
            )));
        }
        participant.state = LifecycleState::Eliminated;
        info!("Eliminated {}", id);
        self.emit(MeshEvent::ParticipantEliminated { id: id.to_string() });
        Ok(())
    }

    pub fn revive(&mut self, id: &str) -> Result<()> {
        self.require_host()?;
        let participant = self.participant_mut(id)?;
        if participant.state != LifecycleState::Eliminated {
            return Err(MeshError::InvalidTransition(format!(
                "cannot revive {} while {:?}",
                id, participant.state
            )));
        }
        participant.state = LifecycleState::Active;
        info!("Revived {}", id);
        self.emit(MeshEvent::ParticipantRevived { id: id.to_string() });
        Ok(())
    }

    /// Wait for the next endpoint event or a user-ended screen share.
    pub async fn next_input(&mut self) -> MeshInput {
        tokio::select! {
            Some(event) = self.endpoint_rx.recv() => MeshInput::Endpoint(event),
            _ = self.media.screen_share_ended() => MeshInput::ScreenShareEnded,
        }
    }

    pub async fn process(&mut self, input: MeshInput) {
        if self.shut_down {
            debug!("Dropping {:?} after teardown", input);
            return;
        }
        match input {
            MeshInput::Endpoint(EndpointEvent::IncomingSession(offer)) => {
                self.handle_offer(offer).await
            }
            MeshInput::Endpoint(EndpointEvent::Session(event)) => self.handle_session_event(event),
            MeshInput::ScreenShareEnded => self.fall_back_to_camera().await,
        }
    }

    /// Process everything already queued, without waiting. Returns how many
    /// endpoint events were handled.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.endpoint_rx.try_recv() {
            self.process(MeshInput::Endpoint(event)).await;
            handled += 1;
        }
        handled
    }

    /// Give up on sessions that have been connecting for longer than
    /// `timeout`.
    pub fn expire_connecting(&mut self, timeout: Duration) {
        let now = Instant::now();
        let stale: Vec<String> = self
            .participants
            .iter()
            .filter(|p| {
                p.state == LifecycleState::Connecting
                    && now.duration_since(p.connecting_since) >= timeout
            })
            .map(|p| p.id.clone())
            .collect();
        for id in stale {
            self.registry.unregister(&id);
            self.remove_participant(&id, "connection timed out".to_string());
        }

        let expired_call = self.host_link.as_ref().and_then(|l| {
            (l.state == HostLinkState::Calling && now.duration_since(l.since) >= timeout)
                .then(|| l.address.clone())
        });
        if let Some(address) = expired_call {
            self.registry.unregister(&address);
            if let Some(link) = self.host_link.as_mut() {
                link.state = HostLinkState::Lost;
            }
            warn!("Timed out waiting for host {}", address);
            self.emit(MeshEvent::HostDisconnected(MeshError::RemoteDisconnected(
                "timed out waiting for host".to_string(),
            )));
        }
    }

    /// Close every session, release local media and drop our identity.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.registry.close_all();
        self.participants.clear();
        self.host_link = None;
        self.media.release();
        self.endpoint.close().await;
        info!("Mesh session torn down ({})", self.role.name());
    }

    async fn handle_offer(&mut self, offer: SessionOffer) {
        if self.role != SessionRole::Host {
            debug!("Joiner refusing offer from {}", offer.remote);
            self.endpoint.reject(offer);
            return;
        }
        if self.registry.count() >= MAX_CONTESTANTS {
            info!(
                "Lobby full ({}/{}), rejecting {}",
                self.registry.count(),
                MAX_CONTESTANTS,
                offer.remote
            );
            self.endpoint.reject(offer);
            return;
        }
        let Some(local) = self.media.current().cloned() else {
            warn!("No local media, rejecting {}", offer.remote);
            self.endpoint.reject(offer);
            return;
        };

        let remote = offer.remote.clone();
        let handle = match self.endpoint.accept(offer, local).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!("Could not accept offer from {}: {}", remote, e);
                return;
            }
        };
        let handle_id = handle.id();
        if let Err(e) = self.registry.register(&remote, handle) {
            warn!("Ignoring second session from {}: {}", remote, e);
            return;
        }
        self.participants.push(Participant {
            id: remote.clone(),
            role: Role::Contestant,
            state: LifecycleState::Connecting,
            handle: handle_id,
            stream: None,
            joined_at: None,
            connecting_since: Instant::now(),
        });
        info!(
            "Accepted {} as session {} ({}/{})",
            remote,
            handle_id,
            self.registry.count(),
            MAX_CONTESTANTS
        );
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        let SessionEvent {
            handle,
            remote,
            signal,
        } = event;
        let Some(session) = self
            .registry
            .get_mut(&remote)
            .filter(|session| session.id() == handle)
        else {
            debug!("Ignoring {} for stale session {} ({})", signal.name(), handle, remote);
            return;
        };
        let state = match session.apply(&signal) {
            Ok(state) => state.clone(),
            Err(e) => {
                debug!("Session {} from {}: {}", handle, remote, e);
                return;
            }
        };
        match self.role {
            SessionRole::Host => self.on_contestant_signal(&remote, state, signal),
            SessionRole::Joiner(_) => self.on_host_signal(&remote, state, signal),
        }
    }

    fn on_contestant_signal(&mut self, remote: &str, state: SessionState, signal: SessionSignal) {
        match state {
            SessionState::Pending => {}
            SessionState::Active => {
                let SessionSignal::StreamReceived(stream) = signal else {
                    return;
                };
                let first = !self.participants.iter().any(|p| p.joined_at.is_some());
                let Some(participant) = self.participants.iter_mut().find(|p| p.id == remote)
                else {
                    return;
                };
                if participant.state != LifecycleState::Connecting {
                    participant.stream = Some(stream);
                    let info = participant.info();
                    debug!("Stream from {} replaced", remote);
                    self.emit(MeshEvent::ParticipantStreamChanged(info));
                    return;
                }
                participant.state = LifecycleState::Active;
                participant.stream = Some(stream);
                participant.joined_at = Some(Utc::now());
                let info = participant.info();
                info!("{} joined", remote);
                self.emit(MeshEvent::ParticipantJoined(info));
                if first {
                    self.emit(MeshEvent::StartRoundTimer);
                }
            }
            SessionState::Closed | SessionState::Errored(_) => {
                let reason = match state {
                    SessionState::Errored(reason) => reason,
                    _ => "remote hung up".to_string(),
                };
                drop(self.registry.take(remote));
                self.remove_participant(remote, reason);
            }
        }
    }

    fn on_host_signal(&mut self, remote: &str, state: SessionState, signal: SessionSignal) {
        let matches_link = self.host_link.as_ref().is_some_and(|l| l.address == remote);
        if !matches_link {
            return;
        }
        match state {
            SessionState::Pending => {}
            SessionState::Active => {
                let SessionSignal::StreamReceived(stream) = signal else {
                    return;
                };
                let info = stream.info();
                if let Some(link) = self.host_link.as_mut() {
                    link.state = HostLinkState::Connected;
                    link.stream = Some(stream);
                }
                info!("Host stream ready from {}", remote);
                self.emit(MeshEvent::HostStreamReady(info));
            }
            SessionState::Closed | SessionState::Errored(_) => {
                drop(self.registry.take(remote));
                if let Some(link) = self.host_link.as_mut() {
                    link.state = HostLinkState::Lost;
                    link.stream = None;
                }
                let error = match (signal, state) {
                    (SessionSignal::Rejected, _) => MeshError::SessionRejected,
                    (_, SessionState::Errored(reason)) => MeshError::RemoteDisconnected(reason),
                    _ => MeshError::RemoteDisconnected("host closed the session".to_string()),
                };
                warn!("Disconnected from host {}: {}", remote, error);
                self.emit(MeshEvent::HostDisconnected(error));
            }
        }
    }

    async fn fall_back_to_camera(&mut self) {
        info!("Screen share ended by user, falling back to camera");
        if let Err(e) = self.acquire_camera().await {
            warn!("Camera fallback failed: {}", e);
            self.media.release();
            self.emit(MeshEvent::Error(e));
        }
    }

    fn remove_participant(&mut self, id: &str, reason: String) {
        if let Some(pos) = self.participants.iter().position(|p| p.id == id) {
            let mut participant = self.participants.remove(pos);
            participant.state = LifecycleState::Disconnected;
            info!("{} left: {}", id, reason);
            self.emit(MeshEvent::ParticipantLeft {
                info: participant.info(),
                reason,
            });
        }
    }

    fn participant_mut(&mut self, id: &str) -> Result<&mut Participant> {
        self.participants
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| MeshError::UnknownParticipant(id.to_string()))
    }

    /// Point every session at the new stream and tell the controller.
    fn publish_local(&mut self, stream: &Arc<MediaStream>) -> StreamInfo {
        self.registry.replace_local_stream(stream);
        let info = stream.info();
        self.emit(MeshEvent::LocalMediaChanged(Some(info.clone())));
        info
    }

    fn emit_local_media(&self) {
        let info = self.media.current().map(|s| s.info());
        self.emit(MeshEvent::LocalMediaChanged(info));
    }

    fn require_host(&self) -> Result<()> {
        match self.role {
            SessionRole::Host => Ok(()),
            role => Err(MeshError::WrongRole(role.name())),
        }
    }

    fn require_joiner(&self) -> Result<JoinMode> {
        match self.role {
            SessionRole::Joiner(mode) => Ok(mode),
            role => Err(MeshError::WrongRole(role.name())),
        }
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }
}
