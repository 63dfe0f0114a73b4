//! Peer registry: one connection per remote participant.
//!
//! A PeerId is present iff its connection object was created and not yet torn
//! down. All mutation happens on the session task, so no locking.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};

use super::connection::PeerConnection;
use super::negotiation::NegotiationState;
use super::transport::{MediaBackend, PeerTransport};
use crate::audio::{LocalStream, MixGraph};
use crate::error::VoiceError;
use crate::ice::IceServerConfig;
use crate::session::{EventSender, PeerEvents};
use crate::signaling::PeerId;

/// Result of `PeerRegistry::create`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// New connection with this generation
    Created(u64),
    /// Entry already present; nothing changed
    AlreadyConnected,
}

/// Registry of live peer connections
pub struct PeerRegistry<B: MediaBackend> {
    backend: Arc<B>,
    ice_servers: Vec<IceServerConfig>,
    peers: HashMap<PeerId, PeerConnection<B>>,
    next_generation: u64,
}

impl<B: MediaBackend> PeerRegistry<B> {
    /// Create an empty registry.
    ///
    /// # Arguments
    /// * `backend` - Media stack that opens connection objects
    /// * `ice_servers` - STUN/TURN list every connection is configured with
    pub fn new(backend: Arc<B>, ice_servers: Vec<IceServerConfig>) -> Self {
        Self {
            backend,
            ice_servers,
            peers: HashMap::new(),
            next_generation: 1,
        }
    }

    /// Open a connection for `id`, attach the local track and connect a new
    /// spatial node into the mix.
    ///
    /// A second call for a present id changes nothing. Fails with
    /// `LocalStreamMissing` when no microphone track exists yet.
    pub async fn create(
        &mut self,
        id: &PeerId,
        local: Option<&LocalStream<B::LocalTrack>>,
        graph: &mut MixGraph,
        events: &EventSender<B>,
    ) -> Result<CreateOutcome, VoiceError> {
        if self.peers.contains_key(id) {
            debug!("[PeerRegistry] Already connected to {}", id);
            return Ok(CreateOutcome::AlreadyConnected);
        }

        let local = local.ok_or(VoiceError::LocalStreamMissing)?;
        let generation = self.next_generation;
        self.next_generation += 1;

        let peer_events = PeerEvents::new(id.clone(), generation, events.clone());
        let connection = self
            .backend
            .open_connection(&self.ice_servers, local.track(), peer_events)
            .await?;

        let node = graph.create_spatial_node();
        graph.connect(node);

        self.peers
            .insert(id.clone(), PeerConnection::new(id.clone(), generation, connection, node));
        info!("[PeerRegistry] Created connection for {} ({} active)", id, self.peers.len());

        Ok(CreateOutcome::Created(generation))
    }

    /// Tear down `id`. Returns false if it was not present.
    pub async fn remove(&mut self, id: &PeerId, graph: &mut MixGraph) -> bool {
        let Some(mut peer) = self.peers.remove(id) else {
            debug!("[PeerRegistry] Remove for unknown peer {}", id);
            return false;
        };

        teardown(&mut peer, graph).await;
        info!("[PeerRegistry] Removed {} ({} active)", id, self.peers.len());
        true
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerConnection<B>> {
        self.peers.get(id)
    }

    pub fn get_mut(&mut self, id: &PeerId) -> Option<&mut PeerConnection<B>> {
        self.peers.get_mut(id)
    }

    /// Entry for `id` only if it is still the connection of `generation`.
    pub fn get_current(&mut self, id: &PeerId, generation: u64) -> Option<&mut PeerConnection<B>> {
        self.peers.get_mut(id).filter(|p| p.generation() == generation)
    }

    /// Close every connection and empty the registry. Returns how many closed.
    pub async fn clear(&mut self, graph: &mut MixGraph) -> usize {
        let count = self.peers.len();
        for (_, mut peer) in self.peers.drain() {
            teardown(&mut peer, graph).await;
        }
        if count > 0 {
            info!("[PeerRegistry] Closed {} connection(s)", count);
        }
        count
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

async fn teardown<B: MediaBackend>(peer: &mut PeerConnection<B>, graph: &mut MixGraph) {
    let node = peer.spatial_node();
    graph.disconnect(node);
    graph.remove_node(node);
    peer.set_state(NegotiationState::Closed);

    if let Err(e) = peer.connection().close().await {
        warn!("[PeerRegistry] Failed to close connection for {}: {}", peer.id(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionEvent;
    use crate::testing::{Call, FakeBackend, FakeMic};
    use tokio::sync::mpsc;

    struct Fixture {
        registry: PeerRegistry<FakeBackend>,
        backend: Arc<FakeBackend>,
        graph: MixGraph,
        local: LocalStream<FakeMic>,
        events: EventSender<FakeBackend>,
        _rx: mpsc::UnboundedReceiver<SessionEvent<FakeBackend>>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(FakeBackend::new());
        let (events, rx) = mpsc::unbounded_channel();
        Fixture {
            registry: PeerRegistry::new(backend.clone(), crate::ice::default_ice_servers()),
            backend,
            graph: MixGraph::new(256),
            local: LocalStream::new(FakeMic::default(), true),
            events,
            _rx: rx,
        }
    }

    #[tokio::test]
    async fn test_create_then_remove_leaves_nothing() {
        let mut f = fixture();
        let id = PeerId::from("p1");

        let outcome = f.registry.create(&id, Some(&f.local), &mut f.graph, &f.events).await.unwrap();
        assert!(matches!(outcome, CreateOutcome::Created(_)));
        assert!(f.registry.contains(&id));
        assert_eq!(f.graph.connected_count(), 1);

        assert!(f.registry.remove(&id, &mut f.graph).await);
        assert!(!f.registry.contains(&id));
        assert_eq!(f.graph.connected_count(), 0);
        assert_eq!(f.graph.node_count(), 0);
        assert_eq!(f.backend.transport(&id).unwrap().calls(), vec![Call::Close]);
    }

    #[tokio::test]
    async fn test_create_twice_keeps_one_connection() {
        let mut f = fixture();
        let id = PeerId::from("p1");

        f.registry.create(&id, Some(&f.local), &mut f.graph, &f.events).await.unwrap();
        let second = f.registry.create(&id, Some(&f.local), &mut f.graph, &f.events).await.unwrap();

        assert_eq!(second, CreateOutcome::AlreadyConnected);
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.backend.opened(), vec![id]);
        assert_eq!(f.graph.node_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_twice_is_noop() {
        let mut f = fixture();
        let id = PeerId::from("p1");

        f.registry.create(&id, Some(&f.local), &mut f.graph, &f.events).await.unwrap();
        assert!(f.registry.remove(&id, &mut f.graph).await);
        assert!(!f.registry.remove(&id, &mut f.graph).await);
        assert_eq!(f.backend.transport(&id).unwrap().calls(), vec![Call::Close]);
    }

    #[tokio::test]
    async fn test_create_requires_local_stream() {
        let mut f = fixture();
        let id = PeerId::from("p1");

        let result = f.registry.create(&id, None, &mut f.graph, &f.events).await;
        assert!(matches!(result, Err(VoiceError::LocalStreamMissing)));
        assert!(f.registry.is_empty());
        assert_eq!(f.graph.node_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_open_inserts_nothing() {
        let mut f = fixture();
        f.backend.fail_next_open();
        let id = PeerId::from("p1");

        let result = f.registry.create(&id, Some(&f.local), &mut f.graph, &f.events).await;
        assert!(matches!(result, Err(VoiceError::Connection(_))));
        assert!(f.registry.is_empty());
        assert_eq!(f.graph.node_count(), 0);
    }

    #[tokio::test]
    async fn test_generations_distinguish_recreated_peers() {
        let mut f = fixture();
        let id = PeerId::from("p1");

        let first = f.registry.create(&id, Some(&f.local), &mut f.graph, &f.events).await.unwrap();
        f.registry.remove(&id, &mut f.graph).await;
        let second = f.registry.create(&id, Some(&f.local), &mut f.graph, &f.events).await.unwrap();

        let (CreateOutcome::Created(g1), CreateOutcome::Created(g2)) = (first, second) else {
            panic!("Expected two creations");
        };
        assert_ne!(g1, g2);
        assert!(f.registry.get_current(&id, g1).is_none());
        assert!(f.registry.get_current(&id, g2).is_some());
    }

    #[tokio::test]
    async fn test_clear_closes_everything() {
        let mut f = fixture();
        for name in ["a", "b", "c"] {
            f.registry
                .create(&PeerId::from(name), Some(&f.local), &mut f.graph, &f.events)
                .await
                .unwrap();
        }

        assert_eq!(f.registry.clear(&mut f.graph).await, 3);
        assert!(f.registry.is_empty());
        assert_eq!(f.graph.node_count(), 0);
        for name in ["a", "b", "c"] {
            let calls = f.backend.transport(&PeerId::from(name)).unwrap().calls();
            assert_eq!(calls, vec![Call::Close]);
        }
    }
}
