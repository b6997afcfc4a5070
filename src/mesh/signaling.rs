use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::mesh::media::MediaStream;
use crate::mesh::session::{SessionEvent, SessionHandle};

/// A session a remote party wants to open toward us, not yet answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOffer {
    /// Endpoint-scoped token identifying the offer.
    pub offer_id: u64,
    /// Signaling address of the caller.
    pub remote: String,
}

/// Everything an endpoint reports, on one queue so arrival order is kept
/// across offers and session signals.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    IncomingSession(SessionOffer),
    Session(SessionEvent),
}

pub type EndpointSink = mpsc::UnboundedSender<EndpointEvent>;

/// One addressable identity on the external rendezvous service. SDP/ICE
/// exchange happens behind this trait.
#[async_trait]
pub trait SignalingEndpoint: Send {
    /// Register with the rendezvous service and return our address.
    /// Fails with `SignalingUnavailable` if the service cannot be reached.
    async fn open(&mut self) -> Result<String>;

    /// Where inbound offers are delivered.
    fn on_incoming_session(&mut self, handler: EndpointSink);

    /// Where stream-received / rejected / closed / error signals for our
    /// handles are delivered.
    fn on_session_event(&mut self, handler: EndpointSink);

    /// Originate a session. The returned handle is pending.
    async fn call(&mut self, remote_address: &str, local: Arc<MediaStream>) -> Result<SessionHandle>;

    async fn accept(&mut self, offer: SessionOffer, local: Arc<MediaStream>) -> Result<SessionHandle>;

    fn reject(&mut self, offer: SessionOffer);

    /// Drop our identity and every offer still waiting on us.
    async fn close(&mut self);
}

/// Produces a fresh endpoint per game session.
pub trait EndpointFactory: Send + Sync {
    fn create(&self) -> Box<dyn SignalingEndpoint>;
}
