// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Protocol version negotiation and the serialization context threaded
//! through every persisted or wire decode.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A negotiated `{major, minor}` protocol version. Peers settle on the
/// minimum of both sides at connection establishment.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const V0_4: ProtocolVersion = ProtocolVersion::new(0, 4);
    pub const V0_5: ProtocolVersion = ProtocolVersion::new(0, 5);
    pub const V0_6: ProtocolVersion = ProtocolVersion::new(0, 6);
    pub const V0_9: ProtocolVersion = ProtocolVersion::new(0, 9);

    /// The version this build speaks natively.
    pub const CURRENT: ProtocolVersion = Self::V0_9;

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// `accept` values may be quorums, and decision records carry the
    /// pending quorum proposal.
    pub fn quorum_values(&self) -> bool {
        *self >= Self::V0_5
    }

    /// The confirm phase is mandatory.
    pub fn mandatory_confirm(&self) -> bool {
        *self >= Self::V0_6
    }

    /// `propose` carries an insert flag.
    pub fn insert_flag(&self) -> bool {
        *self >= Self::V0_9
    }

    /// The `propagate` RPC exists.
    pub fn propagate_rpc(&self) -> bool {
        *self >= Self::V0_9
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl fmt::Debug for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolVersion({})", self)
    }
}

/// Context passed explicitly through every version-gated encode and
/// decode, instead of an ambient thread-local.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerializationContext {
    pub protocol: ProtocolVersion,
}

impl SerializationContext {
    pub fn new(protocol: ProtocolVersion) -> Self {
        Self { protocol }
    }

    pub fn current() -> Self {
        Self { protocol: ProtocolVersion::CURRENT }
    }
}
