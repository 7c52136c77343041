// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! The replication and consensus layer: a per-block single-decree Paxos
//! state machine with quorum-change support, the client driving values
//! to completion across a peer set, the catalog and rebalancer keeping
//! every block at its replication factor, and the public block-store
//! facade.

pub mod catalog;
pub mod dht;
pub mod local_peer;
pub mod paxos;
pub mod persistence;

mod rebalancer;

pub use dht::{ConflictResolver, Dht};
pub use local_peer::LocalPeer;
pub use paxos::{client::PaxosClient, server::PaxosServer};
