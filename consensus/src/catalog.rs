// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-node bookkeeping: which quorum holds each block, which blocks
//! each node holds, which nodes are live, and the in-memory cache of
//! decision state machines.

use crate::paxos::server::PaxosServer;
use lru::LruCache;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::Mutex as AsyncMutex;
use torus_types::{Address, NodeId, Quorum};
use tracing::debug;

/// Where one block currently lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRepartition {
    pub immutable: bool,
    pub quorum: Quorum,
}

impl BlockRepartition {
    pub fn replication_factor(&self) -> usize {
        self.quorum.len()
    }
}

/// Indexes of known block placements, maintained on every quorum change
/// and eviction. Touched only by the owning node.
#[derive(Default)]
pub struct Catalog {
    quorums: HashMap<Address, BlockRepartition>,
    node_blocks: HashMap<NodeId, BTreeSet<Address>>,
    nodes: HashSet<NodeId>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (or refreshes) the repartition of `address`, keeping the
    /// per-node index in sync.
    pub fn cache(&mut self, address: Address, immutable: bool, quorum: Quorum) {
        if let Some(old) = self.quorums.remove(&address) {
            for node in &old.quorum {
                if let Some(blocks) = self.node_blocks.get_mut(node) {
                    blocks.remove(&address);
                    if blocks.is_empty() {
                        self.node_blocks.remove(node);
                    }
                }
            }
        }
        for node in &quorum {
            self.node_blocks.entry(*node).or_default().insert(address);
        }
        self.quorums
            .insert(address, BlockRepartition { immutable, quorum });
    }

    pub fn remove(&mut self, address: Address) {
        if let Some(old) = self.quorums.remove(&address) {
            for node in &old.quorum {
                if let Some(blocks) = self.node_blocks.get_mut(node) {
                    blocks.remove(&address);
                    if blocks.is_empty() {
                        self.node_blocks.remove(node);
                    }
                }
            }
        }
    }

    pub fn repartition(&self, address: &Address) -> Option<&BlockRepartition> {
        self.quorums.get(address)
    }

    /// Addresses whose quorum contains `node`.
    pub fn blocks_of(&self, node: &NodeId) -> Vec<Address> {
        self.node_blocks
            .get(node)
            .map(|blocks| blocks.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Blocks below `factor` replicas that do not already include
    /// `candidate` in their quorum.
    pub fn expansion_targets(
        &self,
        factor: usize,
        candidate: &NodeId,
    ) -> Vec<(Address, BlockRepartition)> {
        self.quorums
            .iter()
            .filter(|(_, r)| {
                r.replication_factor() < factor
                    && !r.quorum.contains(candidate)
            })
            .map(|(address, r)| (*address, r.clone()))
            .collect()
    }

    pub fn node_discovered(&mut self, node: NodeId) -> bool {
        self.nodes.insert(node)
    }

    pub fn node_disappeared(&mut self, node: NodeId) -> bool {
        self.nodes.remove(&node)
    }

    pub fn is_live(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }
}

/// In-memory cache of decision state machines, keyed by address.
///
/// Loading an entry is what serializes operations per address: callers
/// share the `Arc` and take its async lock. An entry is evictable only
/// while the cache holds the sole reference, which is what prevents a
/// double-load from splitting the local acceptor's brain.
pub struct DecisionCache {
    entries: LruCache<Address, Arc<AsyncMutex<PaxosServer>>>,
    capacity: usize,
}

impl DecisionCache {
    pub fn new(capacity: usize) -> Self {
        Self { entries: LruCache::unbounded(), capacity }
    }

    pub fn get(
        &mut self,
        address: &Address,
    ) -> Option<Arc<AsyncMutex<PaxosServer>>> {
        self.entries.get(address).cloned()
    }

    pub fn insert(
        &mut self,
        address: Address,
        entry: Arc<AsyncMutex<PaxosServer>>,
    ) {
        self.entries.put(address, entry);
        self.trim();
    }

    pub fn remove(&mut self, address: &Address) {
        self.entries.pop(address);
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.entries.peek(address).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops `address` if no operation currently shares it. Used by the
    /// startup inspector to unload blocks that turned out healthy.
    pub fn drop_if_idle(&mut self, address: &Address) -> bool {
        match self.entries.peek(address) {
            Some(entry) if Arc::strong_count(entry) == 1 => {
                self.entries.pop(address);
                true
            },
            _ => false,
        }
    }

    fn trim(&mut self) {
        let overflow = self.entries.len().saturating_sub(self.capacity);
        if overflow == 0 {
            return;
        }
        // In-flight operations hold extra references; those entries must
        // not be unloaded or a reload would duplicate the acceptor.
        let evictable: Vec<Address> = self
            .entries
            .iter()
            .filter(|(_, entry)| Arc::strong_count(entry) == 1)
            .map(|(address, _)| *address)
            .collect();
        // `iter` runs most-recently-used first; evict from the cold end.
        for address in evictable.into_iter().rev().take(overflow) {
            debug!(%address, "evicting idle decision from cache");
            self.entries.pop(&address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quorum_of(ids: &[NodeId]) -> Quorum {
        ids.iter().copied().collect()
    }

    #[test]
    fn cache_keeps_indexes_in_sync() {
        let mut catalog = Catalog::new();
        let a = NodeId::random();
        let b = NodeId::random();
        let c = NodeId::random();
        let address = Address::random_mutable();

        catalog.cache(address, false, quorum_of(&[a, b]));
        assert_eq!(catalog.blocks_of(&a), vec![address]);
        assert_eq!(catalog.blocks_of(&b), vec![address]);

        // Requorum drops the stale node index.
        catalog.cache(address, false, quorum_of(&[a, c]));
        assert_eq!(catalog.blocks_of(&b), Vec::<Address>::new());
        assert_eq!(catalog.blocks_of(&c), vec![address]);

        catalog.remove(address);
        assert_eq!(catalog.blocks_of(&a), Vec::<Address>::new());
        assert!(catalog.repartition(&address).is_none());
    }

    #[test]
    fn expansion_targets_filter() {
        let mut catalog = Catalog::new();
        let a = NodeId::random();
        let b = NodeId::random();
        let candidate = NodeId::random();
        let full = Address::random_mutable();
        let thin = Address::random_mutable();
        let containing = Address::random_mutable();

        catalog.cache(full, false, quorum_of(&[a, b, NodeId::random()]));
        catalog.cache(thin, false, quorum_of(&[a, b]));
        catalog.cache(containing, false, quorum_of(&[a, candidate]));

        let targets = catalog.expansion_targets(3, &candidate);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, thin);
    }

    #[test]
    fn decision_cache_refuses_to_evict_shared_entries() {
        let node = NodeId::random();
        let mut cache = DecisionCache::new(2);
        let busy = Address::random_mutable();
        let server = |q: Quorum| {
            Arc::new(AsyncMutex::new(PaxosServer::new(node, q)))
        };

        let busy_entry = server(Quorum::new());
        cache.insert(busy, busy_entry.clone());
        let _held = busy_entry;

        for _ in 0..4 {
            cache.insert(Address::random_mutable(), server(Quorum::new()));
        }
        // Idle entries were trimmed; the shared one survived.
        assert!(cache.len() <= 3);
        assert!(cache.contains(&busy));
        assert!(!cache.drop_if_idle(&busy));
    }
}
