// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Core types shared by every torus crate: addresses, blocks, Paxos
//! messages, protocol versions and the boundary error taxonomy.

pub mod address;
pub mod block;
pub mod error;
pub mod paxos;
pub mod protocol;

pub use address::{Address, NodeId};
pub use block::{Block, RemoveSignature, StoreMode};
pub use error::Error;
pub use paxos::{Accepted, GetResponse, PromiseResponse, Proposal, Quorum, Value};
pub use protocol::{ProtocolVersion, SerializationContext};
