// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! A fully static overlay: a registry of known peers, routed by XOR
//! distance between node id and block address. All nodes of a cluster
//! route identically, which makes it the overlay of choice for tests and
//! small fixed deployments.

use crate::{Overlay, OverlayEvent, WeakPeer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tokio::sync::broadcast;
use torus_network::Peer;
use torus_types::{Address, NodeId, Quorum};
use tracing::debug;

const EVENT_CHANNEL_SIZE: usize = 256;

pub struct StaticOverlay {
    peers: Mutex<HashMap<NodeId, WeakPeer>>,
    events: broadcast::Sender<OverlayEvent>,
}

impl StaticOverlay {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self { peers: Mutex::new(HashMap::new()), events }
    }

    /// Registers a peer and announces its discovery. The overlay keeps a
    /// weak handle only; the caller stays responsible for the peer's
    /// lifetime.
    pub fn connect(&self, peer: &Arc<dyn Peer>) {
        let id = peer.id();
        let inserted = self
            .peers
            .lock()
            .insert(id, Arc::downgrade(peer))
            .is_none();
        if inserted {
            debug!(peer = %id, "overlay discovered peer");
            let _ = self.events.send(OverlayEvent::Discover(id));
        }
    }

    /// Drops a peer from the registry and announces its disappearance.
    pub fn disconnect(&self, id: NodeId) {
        if self.peers.lock().remove(&id).is_some() {
            debug!(peer = %id, "overlay lost peer");
            let _ = self.events.send(OverlayEvent::Disappear(id));
        }
    }

    /// Live peers ordered by XOR distance to `address`.
    fn ranked(&self, address: Address) -> Vec<(NodeId, WeakPeer)> {
        let mut peers: Vec<(NodeId, WeakPeer)> = self
            .peers
            .lock()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .map(|(id, weak)| (*id, Weak::clone(weak)))
            .collect();
        peers.sort_by_key(|(id, _)| xor_distance(id, &address));
        peers
    }
}

impl Default for StaticOverlay {
    fn default() -> Self {
        Self::new()
    }
}

fn xor_distance(id: &NodeId, address: &Address) -> [u8; 32] {
    let mut distance = [0u8; 32];
    for (i, (a, b)) in
        id.as_bytes().iter().zip(address.as_bytes()).enumerate()
    {
        distance[i] = a ^ b;
    }
    distance
}

#[async_trait]
impl Overlay for StaticOverlay {
    async fn lookup(&self, address: Address, count: usize) -> Vec<WeakPeer> {
        self.ranked(address)
            .into_iter()
            .take(count)
            .map(|(_, weak)| weak)
            .collect()
    }

    async fn allocate(&self, address: Address, count: usize) -> Vec<WeakPeer> {
        // With a static registry, fresh owners are simply the closest
        // live peers.
        self.lookup(address, count).await
    }

    async fn lookup_nodes(&self, ids: &Quorum) -> HashMap<NodeId, WeakPeer> {
        let peers = self.peers.lock();
        ids.iter()
            .filter_map(|id| {
                peers
                    .get(id)
                    .filter(|weak| weak.strong_count() > 0)
                    .map(|weak| (*id, Weak::clone(weak)))
            })
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use torus_types::{
        Block, Error, GetResponse, PromiseResponse, Proposal, RemoveSignature,
        StoreMode, Value,
    };

    struct NullPeer(NodeId);

    #[async_trait]
    impl Peer for NullPeer {
        fn id(&self) -> NodeId {
            self.0
        }

        async fn propose(
            &self,
            _: &Quorum,
            address: Address,
            _: Proposal,
            _: bool,
        ) -> Result<PromiseResponse, Error> {
            Err(Error::MissingBlock(address))
        }

        async fn accept(
            &self,
            _: &Quorum,
            address: Address,
            _: Proposal,
            _: Value,
        ) -> Result<Proposal, Error> {
            Err(Error::MissingBlock(address))
        }

        async fn confirm(
            &self,
            _: &Quorum,
            _: Address,
            _: Proposal,
        ) -> Result<(), Error> {
            Ok(())
        }

        async fn get(
            &self,
            _: &Quorum,
            _: Address,
            _: Option<u64>,
        ) -> Result<Option<GetResponse>, Error> {
            Ok(None)
        }

        async fn store(&self, _: Block, _: StoreMode) -> Result<(), Error> {
            Ok(())
        }

        async fn fetch(
            &self,
            address: Address,
            _: Option<u64>,
        ) -> Result<Option<Block>, Error> {
            Err(Error::MissingBlock(address))
        }

        async fn remove(
            &self,
            _: Address,
            _: RemoveSignature,
        ) -> Result<(), Error> {
            Ok(())
        }

        async fn reconcile(&self, _: Address) -> Result<bool, Error> {
            Ok(false)
        }

        async fn propagate(
            &self,
            _: &Quorum,
            _: Block,
            _: Proposal,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    fn peer() -> Arc<dyn Peer> {
        Arc::new(NullPeer(NodeId::random()))
    }

    #[tokio::test]
    async fn lookup_is_bounded_and_live() {
        let overlay = StaticOverlay::new();
        let kept: Vec<Arc<dyn Peer>> = (0..4).map(|_| peer()).collect();
        for p in &kept {
            overlay.connect(p);
        }
        let dropped = peer();
        overlay.connect(&dropped);
        drop(dropped);

        let address = Address::random_mutable();
        let found = overlay.lookup(address, 3).await;
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|weak| weak.upgrade().is_some()));
        // Asking for more than exists returns what is live.
        assert_eq!(overlay.lookup(address, 16).await.len(), 4);
    }

    #[tokio::test]
    async fn lookup_ranks_consistently() {
        let overlay = StaticOverlay::new();
        let peers: Vec<Arc<dyn Peer>> = (0..5).map(|_| peer()).collect();
        for p in &peers {
            overlay.connect(p);
        }
        let address = Address::random_mutable();
        let first: Vec<NodeId> = overlay
            .lookup(address, 3)
            .await
            .iter()
            .map(|weak| weak.upgrade().unwrap().id())
            .collect();
        let second: Vec<NodeId> = overlay
            .lookup(address, 3)
            .await
            .iter()
            .map(|weak| weak.upgrade().unwrap().id())
            .collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn events_fire_once_per_transition() {
        let overlay = StaticOverlay::new();
        let mut events = overlay.subscribe();
        let p = peer();
        let id = p.id();
        overlay.connect(&p);
        overlay.connect(&p);
        overlay.disconnect(id);
        overlay.disconnect(id);
        assert_eq!(events.try_recv().unwrap(), OverlayEvent::Discover(id));
        assert_eq!(events.try_recv().unwrap(), OverlayEvent::Disappear(id));
        claims::assert_err!(events.try_recv());
    }

    #[tokio::test]
    async fn lookup_nodes_skips_missing_entries() {
        let overlay = StaticOverlay::new();
        let p = peer();
        overlay.connect(&p);
        let mut ids = Quorum::new();
        ids.insert(p.id());
        ids.insert(NodeId::random());
        let resolved = overlay.lookup_nodes(&ids).await;
        assert_eq!(resolved.len(), 1);
        assert!(resolved.contains_key(&p.id()));
    }
}
