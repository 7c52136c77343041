// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Advisory routing: given a block address, which peers should hold it?
//!
//! The overlay never owns peers. It hands out weak handles, and lookups
//! tolerate peers disappearing between the lookup and the lock. Peer
//! lifetime is the business of whoever registered them.

mod static_overlay;

pub use static_overlay::StaticOverlay;

use async_trait::async_trait;
use std::{collections::HashMap, sync::Weak};
use tokio::sync::broadcast;
use torus_network::Peer;
use torus_types::{Address, NodeId, Quorum};

/// A peer handle that may be dead by the time it is locked.
pub type WeakPeer = Weak<dyn Peer>;

/// Membership transitions, fired once per change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverlayEvent {
    Discover(NodeId),
    Disappear(NodeId),
}

/// Best-effort routing from addresses to candidate peers.
#[async_trait]
pub trait Overlay: Send + Sync + 'static {
    /// Up to `count` peers responsible for `address`. May return fewer.
    async fn lookup(&self, address: Address, count: usize) -> Vec<WeakPeer>;

    /// Up to `count` fresh owner candidates for a new block at `address`.
    async fn allocate(&self, address: Address, count: usize) -> Vec<WeakPeer>;

    /// Resolves node ids to handles; missing entries are permitted.
    async fn lookup_nodes(&self, ids: &Quorum) -> HashMap<NodeId, WeakPeer>;

    /// Subscribes to discover/disappear notifications.
    fn subscribe(&self) -> broadcast::Receiver<OverlayEvent>;
}
