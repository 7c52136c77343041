// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! The peer seam: one trait covering the nine consensus RPCs, a wire
//! envelope to carry them, and a remote stub that remaps transport
//! failures into the consensus error taxonomy.

pub mod peer;
pub mod transport;
pub mod wire;

mod remote;
mod server;


pub use peer::Peer;
pub use remote::RemotePeer;
pub use server::serve;
pub use transport::{connect, Connection};
