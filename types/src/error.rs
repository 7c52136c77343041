// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! The error taxonomy surfaced at every torus boundary.
//!
//! Errors are plain data: they cross the wire inside RPC responses, so
//! the enum is serializable and carries structured context (the expected
//! quorum, the conflicting block) rather than opaque sources.

use crate::{
    address::Address,
    block::Block,
    paxos::{Proposal, Quorum},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
pub enum Error {
    /// No reachable owner holds the block.
    #[error("missing block at {0}")]
    MissingBlock(Address),

    /// The value changed concurrently; `current` carries the winner for
    /// conflict resolution when known.
    #[error("conflict: {reason}")]
    Conflict {
        reason: String,
        current: Option<Box<Block>>,
    },

    /// A cryptographic or ACL check failed.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The caller addressed a stale quorum; `expected` is the acceptor's
    /// current membership.
    #[error("wrong quorum, expected {expected:?}")]
    WrongQuorum {
        expected: Quorum,
        proposal: Option<Proposal>,
    },

    /// A peer could not be reached. Always retryable elsewhere.
    #[error("peer unavailable: {0}")]
    Unavailable(String),

    /// An error downgraded to advisory because a quorum may still
    /// succeed without this peer.
    #[error("weak error: {0}")]
    WeakError(Box<Error>),

    /// A read could not converge on a single state.
    #[error("partial state for {0}")]
    PartialState(Address),

    /// Fewer peers answered than a majority of the quorum.
    #[error("too few peers: {reached} of {total}")]
    TooFewPeers { reached: usize, total: usize },

    /// The overlay produced no usable peer at all.
    #[error("no peers available for {0}")]
    NoPeersAvailable(Address),

    /// The remote end does not know this RPC. Ignorable in broadcast
    /// contexts.
    #[error("unknown RPC {0}")]
    UnknownRpc(String),

    /// A storage backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A malformed frame or a version-incompatible encoding.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A protocol violation the receiving peer refuses to process.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl Error {
    /// Wraps an error as weak: fatal only if no quorum succeeds.
    pub fn weak(error: Error) -> Self {
        match error {
            weak @ Error::WeakError(_) => weak,
            other => Error::WeakError(Box::new(other)),
        }
    }

    /// Unwraps weak errors down to the underlying failure.
    pub fn strength(&self) -> &Error {
        match self {
            Error::WeakError(inner) => inner.strength(),
            other => other,
        }
    }

    /// Whether this error means the block does not exist on the peer,
    /// directly or under a weak wrapper.
    pub fn is_missing_block(&self) -> bool {
        matches!(self.strength(), Error::MissingBlock(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
