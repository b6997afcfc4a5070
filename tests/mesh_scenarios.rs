use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use popstage_lib::error::MeshError;
use popstage_lib::mesh::coordinator::{HostLinkState, MeshCoordinator, SessionRole};
use popstage_lib::mesh::loopback::LoopbackBroker;
use popstage_lib::mesh::media::SyntheticDevices;
use popstage_lib::mesh::{JoinMedia, JoinMode, LifecycleState, MeshEvent, MAX_CONTESTANTS};

struct Peer {
    mesh: MeshCoordinator,
    events: mpsc::UnboundedReceiver<MeshEvent>,
}

impl Peer {
    fn new(broker: &LoopbackBroker, role: SessionRole) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        Self {
            mesh: MeshCoordinator::new(role, Box::new(broker.endpoint()), Arc::new(SyntheticDevices), tx),
            events,
        }
    }

    fn address(&self) -> String {
        self.mesh.address().expect("identity open").to_string()
    }

    fn drain(&mut self) -> Vec<MeshEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Registry 1:1 with every participant that is not disconnected.
    fn assert_registry_matches(&self) {
        let live: Vec<_> = self
            .mesh
            .participants()
            .iter()
            .filter(|p| p.state != LifecycleState::Disconnected)
            .collect();
        assert_eq!(live.len(), self.mesh.registry().count());
        for p in live {
            assert_eq!(self.mesh.registry().get(&p.id).map(|h| h.id()), Some(p.handle));
        }
    }
}

async fn host(broker: &LoopbackBroker) -> Peer {
    let mut host = Peer::new(broker, SessionRole::Host);
    host.mesh.start_hosting(1, Duration::ZERO).await.unwrap();
    host
}

async fn contestant(broker: &LoopbackBroker, host_address: &str) -> Peer {
    let mut peer = Peer::new(broker, SessionRole::Joiner(JoinMode::Contestant));
    peer.mesh
        .start_joining(host_address, JoinMedia::Camera, 1, Duration::ZERO)
        .await
        .unwrap();
    peer
}

/// Host with six active contestants A..F.
async fn full_lobby(broker: &LoopbackBroker) -> (Peer, Vec<Peer>) {
    let mut host = host(broker).await;
    let address = host.address();
    let mut joiners = Vec::new();
    for _ in 0..MAX_CONTESTANTS {
        joiners.push(contestant(broker, &address).await);
        host.mesh.process_pending().await;
    }
    for joiner in &mut joiners {
        joiner.mesh.process_pending().await;
    }
    (host, joiners)
}

#[tokio::test]
async fn six_join_and_the_seventh_is_turned_away() {
    let broker = LoopbackBroker::new();
    let (mut host, _joiners) = full_lobby(&broker).await;

    assert_eq!(host.mesh.participants().len(), 6);
    assert!(host
        .mesh
        .participants()
        .iter()
        .all(|p| p.state == LifecycleState::Active));

    let mut g = contestant(&broker, &host.address()).await;
    host.mesh.process_pending().await;
    g.mesh.process_pending().await;

    assert_eq!(host.mesh.registry().count(), 6);
    assert!(!host.mesh.registry().contains(&g.address()));
    assert!(g
        .drain()
        .iter()
        .any(|e| matches!(e, MeshEvent::HostDisconnected(MeshError::SessionRejected))));
    host.assert_registry_matches();
}

#[tokio::test]
async fn burst_of_offers_never_exceeds_capacity() {
    let broker = LoopbackBroker::new();
    let mut host = host(&broker).await;
    let address = host.address();

    let mut joiners = Vec::new();
    for _ in 0..10 {
        joiners.push(contestant(&broker, &address).await);
    }
    host.mesh.process_pending().await;

    assert_eq!(host.mesh.registry().count(), MAX_CONTESTANTS);
    let mut rejected = 0;
    for joiner in &mut joiners {
        joiner.mesh.process_pending().await;
        if joiner
            .drain()
            .iter()
            .any(|e| matches!(e, MeshEvent::HostDisconnected(MeshError::SessionRejected)))
        {
            rejected += 1;
        }
    }
    // which four lose depends on arrival order only
    assert_eq!(rejected, 4);
    host.assert_registry_matches();
}

#[tokio::test]
async fn eliminated_contestant_keeps_the_same_session() {
    let broker = LoopbackBroker::new();
    let (mut host, joiners) = full_lobby(&broker).await;
    let c = joiners[2].address();
    let before = host.mesh.registry().get(&c).map(|h| h.id());

    host.mesh.eliminate(&c).unwrap();
    assert_eq!(
        host.mesh.participant(&c).map(|p| p.state),
        Some(LifecycleState::Eliminated)
    );
    assert_eq!(host.mesh.registry().count(), 6);

    host.mesh.revive(&c).unwrap();
    assert_eq!(
        host.mesh.participant(&c).map(|p| p.state),
        Some(LifecycleState::Active)
    );
    assert_eq!(host.mesh.registry().get(&c).map(|h| h.id()), before);
    host.assert_registry_matches();
}

#[tokio::test]
async fn closing_one_session_leaves_five() {
    let broker = LoopbackBroker::new();
    let (mut host, mut joiners) = full_lobby(&broker).await;
    let d = joiners[3].address();
    host.drain();

    joiners[3].mesh.shutdown().await;
    host.mesh.process_pending().await;

    assert_eq!(host.mesh.registry().count(), 5);
    assert!(host.mesh.participant(&d).is_none());
    assert!(host
        .drain()
        .iter()
        .any(|e| matches!(e, MeshEvent::ParticipantLeft { info, .. } if info.id == d)));
    host.assert_registry_matches();
}

#[tokio::test]
async fn joiner_loses_host_without_redialing() {
    let broker = LoopbackBroker::new();
    let mut host = host(&broker).await;
    let mut peer = contestant(&broker, &host.address()).await;
    host.mesh.process_pending().await;
    peer.mesh.process_pending().await;

    assert!(peer.mesh.host_stream().is_some());
    assert!(peer
        .drain()
        .iter()
        .any(|e| matches!(e, MeshEvent::HostStreamReady(_))));

    host.mesh.shutdown().await;
    peer.mesh.process_pending().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.mesh.process_pending().await;

    assert_eq!(peer.mesh.host_link_state(), Some(HostLinkState::Lost));
    assert!(peer
        .drain()
        .iter()
        .any(|e| matches!(e, MeshEvent::HostDisconnected(MeshError::RemoteDisconnected(_)))));
    assert_eq!(broker.calls_placed(), 1);
}

#[tokio::test]
async fn screen_share_leaves_exactly_one_live_stream() {
    let broker = LoopbackBroker::new();
    let mut host = host(&broker).await;
    let camera = host.mesh.media().current().cloned().unwrap();

    host.mesh.acquire_screen_share().await.unwrap();

    assert!(camera.tracks().iter().all(|t| !t.is_live()));
    assert!(host.mesh.media().is_screen_sharing());
    assert!(host.mesh.media().is_live());
}

#[tokio::test]
async fn teardown_leaves_nothing_running() {
    let broker = LoopbackBroker::new();
    let (mut host, mut joiners) = full_lobby(&broker).await;
    let local = host.mesh.media().current().cloned().unwrap();

    host.mesh.shutdown().await;

    assert!(host.mesh.registry().is_empty());
    assert!(!host.mesh.media().is_live());
    assert!(!local.is_live());
    assert_eq!(broker.link_count(), 0);

    for joiner in &mut joiners {
        joiner.mesh.process_pending().await;
        assert_eq!(joiner.mesh.host_link_state(), Some(HostLinkState::Lost));
    }
}
