//! Service discovery for the master replica group.
//!
//! A single leader key holds the current leader's address; a followers
//! directory holds one key per follower. Every leadership transition
//! updates both. The store also surfaces peer-state change events the
//! leader uses to evict failed peers from the followers directory.

use crate::error::Result;
use crate::types::NodeId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Key the current leader registers under.
pub const LEADER_KEY: &str = "/shoal/master/leader";

/// Directory followers register under, one key per node id.
pub const FOLLOWERS_DIR: &str = "/shoal/master/followers";

/// Peer-state change observed by the discovery backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Joined(NodeId),
    Failed(NodeId),
}

/// Registration store the master keeps in sync with its raft role.
#[async_trait]
pub trait DiscoveryStore: Send + Sync {
    async fn register_leader(&self, node_id: NodeId, address: &str) -> Result<()>;
    async fn unregister_leader(&self, node_id: NodeId) -> Result<()>;
    async fn register_follower(&self, node_id: NodeId, address: &str) -> Result<()>;
    async fn unregister_follower(&self, node_id: NodeId) -> Result<()>;

    async fn leader(&self) -> Result<Option<(NodeId, String)>>;
    async fn followers(&self) -> Result<Vec<(NodeId, String)>>;

    /// Subscribe to peer-state change notifications.
    fn watch_peers(&self) -> broadcast::Receiver<PeerEvent>;
}

/// In-process discovery store for tests and single-machine clusters.
pub struct InMemoryDiscovery {
    leader: Mutex<Option<(NodeId, String)>>,
    followers: Mutex<HashMap<NodeId, String>>,
    events: broadcast::Sender<PeerEvent>,
}

impl InMemoryDiscovery {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            leader: Mutex::new(None),
            followers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Inject a peer-state observation (the external backend would emit
    /// these from its own health checks).
    pub fn report(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for InMemoryDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiscoveryStore for InMemoryDiscovery {
    async fn register_leader(&self, node_id: NodeId, address: &str) -> Result<()> {
        *self.leader.lock() = Some((node_id, address.to_string()));
        Ok(())
    }

    async fn unregister_leader(&self, node_id: NodeId) -> Result<()> {
        let mut leader = self.leader.lock();
        if leader.as_ref().is_some_and(|(id, _)| *id == node_id) {
            *leader = None;
        }
        Ok(())
    }

    async fn register_follower(&self, node_id: NodeId, address: &str) -> Result<()> {
        self.followers
            .lock()
            .insert(node_id, address.to_string());
        let _ = self.events.send(PeerEvent::Joined(node_id));
        Ok(())
    }

    async fn unregister_follower(&self, node_id: NodeId) -> Result<()> {
        self.followers.lock().remove(&node_id);
        Ok(())
    }

    async fn leader(&self) -> Result<Option<(NodeId, String)>> {
        Ok(self.leader.lock().clone())
    }

    async fn followers(&self) -> Result<Vec<(NodeId, String)>> {
        let mut all: Vec<(NodeId, String)> = self
            .followers
            .lock()
            .iter()
            .map(|(id, addr)| (*id, addr.clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        Ok(all)
    }

    fn watch_peers(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}
