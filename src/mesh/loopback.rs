use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{MeshError, Result};
use crate::mesh::media::MediaStream;
use crate::mesh::session::{
    Direction, HandleId, SessionEvent, SessionHandle, SessionSignal, SessionTransport,
};
use crate::mesh::signaling::{
    EndpointEvent, EndpointFactory, EndpointSink, SessionOffer, SignalingEndpoint,
};

/// One side of a link.
#[derive(Clone)]
struct LinkEnd {
    address: String,
    handle: HandleId,
    events: Option<EndpointSink>,
    stream: Arc<MediaStream>,
}

impl LinkEnd {
    fn notify(&self, remote: &str, signal: SessionSignal) {
        if let Some(events) = &self.events {
            let _ = events.send(EndpointEvent::Session(SessionEvent {
                handle: self.handle,
                remote: remote.to_string(),
                signal,
            }));
        }
    }
}

struct Link {
    caller: LinkEnd,
    callee_address: String,
    /// `None` while the offer is unanswered.
    callee: Option<LinkEnd>,
}

#[derive(Default)]
struct Slot {
    offers: Option<EndpointSink>,
}

struct BrokerInner {
    reachable: bool,
    peers: HashMap<String, Slot>,
    links: HashMap<u64, Link>,
    next_link: u64,
    calls_placed: usize,
}

/// In-process rendezvous service. Endpoints created from the same broker
/// can call each other; sessions are linked directly, with no media relay.
#[derive(Clone)]
pub struct LoopbackBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerInner {
                reachable: true,
                peers: HashMap::new(),
                links: HashMap::new(),
                next_link: 1,
                calls_placed: 0,
            })),
        }
    }

    pub fn endpoint(&self) -> LoopbackEndpoint {
        LoopbackEndpoint {
            broker: self.clone(),
            address: None,
            offers: None,
            events: None,
        }
    }

    /// Simulate the rendezvous service going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Total outbound calls placed through this broker.
    pub fn calls_placed(&self) -> usize {
        self.lock().calls_placed
    }

    /// Number of established or pending links.
    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    /// Fail every link between two addresses, as a transport error would.
    pub fn sever(&self, a: &str, b: &str, reason: &str) {
        let mut inner = self.lock();
        let ids: Vec<u64> = inner
            .links
            .iter()
            .filter(|(_, link)| {
                (link.caller.address == a && link.callee_address == b)
                    || (link.caller.address == b && link.callee_address == a)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(link) = inner.links.remove(&id) {
                warn!("Severing link {} between {} and {}: {}", id, a, b, reason);
                link.caller
                    .notify(&link.callee_address, SessionSignal::Error(reason.to_string()));
                if let Some(callee) = link.callee {
                    callee.notify(&link.caller.address, SessionSignal::Error(reason.to_string()));
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn hang_up(&self, link_id: u64, from_caller: bool) {
        let mut inner = self.lock();
        let Some(link) = inner.links.remove(&link_id) else {
            return;
        };
        if from_caller {
            match link.callee {
                Some(callee) => callee.notify(&link.caller.address, SessionSignal::Closed),
                None => debug!(
                    "Offer {} to {} withdrawn before answer",
                    link_id, link.callee_address
                ),
            }
        } else {
            link.caller.notify(&link.callee_address, SessionSignal::Closed);
        }
    }

    fn replace_stream(&self, link_id: u64, from_caller: bool, stream: Arc<MediaStream>) {
        let mut inner = self.lock();
        let Some(link) = inner.links.get_mut(&link_id) else {
            return;
        };
        if from_caller {
            link.caller.stream = stream.clone();
            if let Some(callee) = &link.callee {
                callee.notify(&link.caller.address, SessionSignal::StreamReceived(stream));
            }
        } else if let Some(callee) = link.callee.as_mut() {
            callee.stream = stream.clone();
            link.caller
                .notify(&link.callee_address, SessionSignal::StreamReceived(stream));
        }
    }
}

impl EndpointFactory for LoopbackBroker {
    fn create(&self) -> Box<dyn SignalingEndpoint> {
        Box::new(self.endpoint())
    }
}

struct LoopbackTransport {
    broker: LoopbackBroker,
    link: u64,
    caller_side: bool,
}

impl SessionTransport for LoopbackTransport {
    fn close(&mut self) {
        self.broker.hang_up(self.link, self.caller_side);
    }

    fn replace_local_stream(&mut self, stream: Arc<MediaStream>) {
        self.broker.replace_stream(self.link, self.caller_side, stream);
    }
}

pub struct LoopbackEndpoint {
    broker: LoopbackBroker,
    address: Option<String>,
    offers: Option<EndpointSink>,
    events: Option<EndpointSink>,
}

#[async_trait]
impl SignalingEndpoint for LoopbackEndpoint {
    async fn open(&mut self) -> Result<String> {
        if let Some(address) = &self.address {
            return Ok(address.clone());
        }
        let mut inner = self.broker.lock();
        if !inner.reachable {
            return Err(MeshError::SignalingUnavailable(
                "rendezvous service unreachable".to_string(),
            ));
        }
        let address = Uuid::new_v4().to_string();
        inner.peers.insert(
            address.clone(),
            Slot {
                offers: self.offers.clone(),
            },
        );
        drop(inner);
        info!("Signaling identity opened: {}", address);
        self.address = Some(address.clone());
        Ok(address)
    }

    fn on_incoming_session(&mut self, handler: EndpointSink) {
        if let Some(address) = &self.address {
            if let Some(slot) = self.broker.lock().peers.get_mut(address) {
                slot.offers = Some(handler.clone());
            }
        }
        self.offers = Some(handler);
    }

    fn on_session_event(&mut self, handler: EndpointSink) {
        self.events = Some(handler);
    }

    async fn call(&mut self, remote_address: &str, local: Arc<MediaStream>) -> Result<SessionHandle> {
        let Some(address) = self.address.clone() else {
            return Err(MeshError::SignalingUnavailable("identity not open".to_string()));
        };
        let handle_id = HandleId::next();
        let caller = LinkEnd {
            address: address.clone(),
            handle: handle_id,
            events: self.events.clone(),
            stream: local,
        };

        let mut inner = self.broker.lock();
        inner.calls_placed += 1;
        let link_id = inner.next_link;
        inner.next_link += 1;

        let offers = inner
            .peers
            .get(remote_address)
            .and_then(|slot| slot.offers.clone());
        match offers {
            Some(offers) => {
                inner.links.insert(
                    link_id,
                    Link {
                        caller,
                        callee_address: remote_address.to_string(),
                        callee: None,
                    },
                );
                let _ = offers.send(EndpointEvent::IncomingSession(SessionOffer {
                    offer_id: link_id,
                    remote: address,
                }));
                debug!("Offer {} sent to {}", link_id, remote_address);
            }
            None => {
                warn!("Call to unknown address {}", remote_address);
                caller.notify(
                    remote_address,
                    SessionSignal::Error(format!("peer unavailable: {}", remote_address)),
                );
            }
        }
        drop(inner);

        Ok(SessionHandle::new(
            handle_id,
            remote_address,
            Direction::Outbound,
            Box::new(LoopbackTransport {
                broker: self.broker.clone(),
                link: link_id,
                caller_side: true,
            }),
        ))
    }

    async fn accept(&mut self, offer: SessionOffer, local: Arc<MediaStream>) -> Result<SessionHandle> {
        let Some(address) = self.address.clone() else {
            return Err(MeshError::SignalingUnavailable("identity not open".to_string()));
        };
        let handle_id = HandleId::next();
        let callee = LinkEnd {
            address: address.clone(),
            handle: handle_id,
            events: self.events.clone(),
            stream: local.clone(),
        };

        let mut inner = self.broker.lock();
        let link = inner
            .links
            .get_mut(&offer.offer_id)
            .filter(|link| link.callee_address == address && link.callee.is_none())
            .ok_or_else(|| {
                MeshError::RemoteDisconnected(format!("offer from {} withdrawn", offer.remote))
            })?;

        link.caller
            .notify(&address, SessionSignal::StreamReceived(local));
        callee.notify(
            &link.caller.address,
            SessionSignal::StreamReceived(link.caller.stream.clone()),
        );
        link.callee = Some(callee);
        drop(inner);

        Ok(SessionHandle::new(
            handle_id,
            offer.remote,
            Direction::Inbound,
            Box::new(LoopbackTransport {
                broker: self.broker.clone(),
                link: offer.offer_id,
                caller_side: false,
            }),
        ))
    }

    fn reject(&mut self, offer: SessionOffer) {
        let mut inner = self.broker.lock();
        if let Some(link) = inner.links.remove(&offer.offer_id) {
            link.caller
                .notify(&link.callee_address, SessionSignal::Rejected);
            debug!("Rejected offer {} from {}", offer.offer_id, offer.remote);
        }
    }

    async fn close(&mut self) {
        self.release_identity();
    }
}

impl LoopbackEndpoint {
    fn release_identity(&mut self) {
        let Some(address) = self.address.take() else {
            return;
        };
        let mut inner = self.broker.lock();
        inner.peers.remove(&address);
        let ids: Vec<u64> = inner
            .links
            .iter()
            .filter(|(_, link)| link.caller.address == address || link.callee_address == address)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(link) = inner.links.remove(&id) {
                if link.caller.address == address {
                    if let Some(callee) = link.callee {
                        callee.notify(&address, SessionSignal::Closed);
                    }
                } else {
                    link.caller.notify(&address, SessionSignal::Closed);
                }
            }
        }
        info!("Signaling identity closed: {}", address);
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        self.release_identity();
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::mesh::session::SessionState;

    struct Peer {
        endpoint: LoopbackEndpoint,
        rx: mpsc::UnboundedReceiver<EndpointEvent>,
        address: String,
    }

    async fn peer(broker: &LoopbackBroker) -> Peer {
        let mut endpoint = broker.endpoint();
        let (tx, rx) = mpsc::unbounded_channel();
        endpoint.on_incoming_session(tx.clone());
        endpoint.on_session_event(tx);
        let address = endpoint.open().await.unwrap();
        Peer { endpoint, rx, address }
    }

    fn next_offer(rx: &mut mpsc::UnboundedReceiver<EndpointEvent>) -> SessionOffer {
        match rx.try_recv() {
            Ok(EndpointEvent::IncomingSession(offer)) => offer,
            other => panic!("expected offer, got {:?}", other),
        }
    }

    fn next_signal(rx: &mut mpsc::UnboundedReceiver<EndpointEvent>) -> SessionEvent {
        match rx.try_recv() {
            Ok(EndpointEvent::Session(event)) => event,
            other => panic!("expected session event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn accepted_call_delivers_streams_both_ways() {
        let broker = LoopbackBroker::new();
        let mut host = peer(&broker).await;
        let mut guest = peer(&broker).await;
        let host_stream = MediaStream::silent();
        let guest_stream = MediaStream::silent();

        let mut outbound = guest
            .endpoint
            .call(&host.address, guest_stream.clone())
            .await
            .unwrap();
        let offer = next_offer(&mut host.rx);
        assert_eq!(offer.remote, guest.address);

        let mut inbound = host.endpoint.accept(offer, host_stream.clone()).await.unwrap();

        let at_guest = next_signal(&mut guest.rx);
        assert_eq!(at_guest.handle, outbound.id());
        let SessionSignal::StreamReceived(s) = &at_guest.signal else {
            panic!("expected stream")
        };
        assert_eq!(s.id(), host_stream.id());
        outbound.apply(&at_guest.signal).unwrap();

        let at_host = next_signal(&mut host.rx);
        assert_eq!(at_host.handle, inbound.id());
        assert_eq!(at_host.remote, guest.address);
        inbound.apply(&at_host.signal).unwrap();
        assert_eq!(inbound.state(), &SessionState::Active);
    }

    #[tokio::test]
    async fn rejected_offer_reaches_caller() {
        let broker = LoopbackBroker::new();
        let mut host = peer(&broker).await;
        let mut guest = peer(&broker).await;

        let outbound = guest
            .endpoint
            .call(&host.address, MediaStream::silent())
            .await
            .unwrap();
        let offer = next_offer(&mut host.rx);
        host.endpoint.reject(offer);

        let event = next_signal(&mut guest.rx);
        assert_eq!(event.handle, outbound.id());
        assert!(matches!(event.signal, SessionSignal::Rejected));
        assert_eq!(broker.link_count(), 0);
    }

    #[tokio::test]
    async fn hang_up_notifies_only_the_far_side() {
        let broker = LoopbackBroker::new();
        let mut host = peer(&broker).await;
        let mut guest = peer(&broker).await;

        let outbound = guest
            .endpoint
            .call(&host.address, MediaStream::silent())
            .await
            .unwrap();
        let offer = next_offer(&mut host.rx);
        let _inbound = host.endpoint.accept(offer, MediaStream::silent()).await.unwrap();
        next_signal(&mut host.rx);
        next_signal(&mut guest.rx);

        drop(outbound);

        let event = next_signal(&mut host.rx);
        assert!(matches!(event.signal, SessionSignal::Closed));
        assert!(guest.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn withdrawn_offer_cannot_be_accepted() {
        let broker = LoopbackBroker::new();
        let mut host = peer(&broker).await;
        let mut guest = peer(&broker).await;

        let outbound = guest
            .endpoint
            .call(&host.address, MediaStream::silent())
            .await
            .unwrap();
        let offer = next_offer(&mut host.rx);
        drop(outbound);

        let err = host
            .endpoint
            .accept(offer, MediaStream::silent())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::RemoteDisconnected(_)));
    }

    #[tokio::test]
    async fn unknown_address_errors_the_pending_handle() {
        let broker = LoopbackBroker::new();
        let mut guest = peer(&broker).await;

        let outbound = guest
            .endpoint
            .call("nobody", MediaStream::silent())
            .await
            .unwrap();
        let event = next_signal(&mut guest.rx);
        assert_eq!(event.handle, outbound.id());
        assert!(matches!(event.signal, SessionSignal::Error(_)));
    }

    #[tokio::test]
    async fn unreachable_service_fails_open() {
        let broker = LoopbackBroker::new();
        broker.set_reachable(false);
        let mut endpoint = broker.endpoint();
        let err = endpoint.open().await.unwrap_err();
        assert!(matches!(err, MeshError::SignalingUnavailable(_)));
    }

    #[tokio::test]
    async fn closing_identity_closes_its_links() {
        let broker = LoopbackBroker::new();
        let mut host = peer(&broker).await;
        let mut guest = peer(&broker).await;

        let _outbound = guest
            .endpoint
            .call(&host.address, MediaStream::silent())
            .await
            .unwrap();
        let offer = next_offer(&mut host.rx);
        let _inbound = host.endpoint.accept(offer, MediaStream::silent()).await.unwrap();
        next_signal(&mut guest.rx);

        host.endpoint.close().await;

        let event = next_signal(&mut guest.rx);
        assert!(matches!(event.signal, SessionSignal::Closed));
        assert_eq!(broker.link_count(), 0);
    }
}
