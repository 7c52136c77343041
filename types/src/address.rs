// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

use ed25519_dalek::PublicKey;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::{fmt, str::FromStr};

/// Number of bytes in an [`Address`] or a [`NodeId`].
pub const LENGTH: usize = 32;

/// Bit of the first byte that tags an address as mutable.
const MUTABLE_BIT: u8 = 0x80;

/// A 256-bit block address. The high bit of the first byte tags the
/// address family: set for mutable blocks (random at creation), clear for
/// immutable blocks (derived from the block contents).
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Address([u8; LENGTH]);

impl Address {
    /// Derives the content address of an immutable block.
    pub fn immutable(owner: &PublicKey, payload: &[u8]) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(owner.as_bytes());
        hasher.update(payload);
        Self::from_digest(hasher, false)
    }

    /// Derives the content address of a named block from its owner and name.
    pub fn named(owner: &PublicKey, name: &str) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(owner.as_bytes());
        hasher.update(b"named");
        hasher.update(name.as_bytes());
        Self::from_digest(hasher, false)
    }

    /// Creates a fresh random mutable address.
    pub fn random_mutable() -> Self {
        let mut bytes = [0u8; LENGTH];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        bytes[0] |= MUTABLE_BIT;
        Self(bytes)
    }

    /// Creates a fresh random immutable address. Test fixtures only: a real
    /// immutable address is always derived from block contents.
    pub fn random_immutable() -> Self {
        let mut bytes = [0u8; LENGTH];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        bytes[0] &= !MUTABLE_BIT;
        Self(bytes)
    }

    fn from_digest(hasher: Sha3_256, mutable: bool) -> Self {
        let digest = hasher.finalize();
        let mut bytes = [0u8; LENGTH];
        bytes.copy_from_slice(&digest);
        if mutable {
            bytes[0] |= MUTABLE_BIT;
        } else {
            bytes[0] &= !MUTABLE_BIT;
        }
        Self(bytes)
    }

    /// Whether this address belongs to the mutable family.
    pub fn is_mutable(&self) -> bool {
        self.0[0] & MUTABLE_BIT != 0
    }

    pub fn as_bytes(&self) -> &[u8; LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; LENGTH]> for Address {
    fn from(bytes: [u8; LENGTH]) -> Self {
        Self(bytes)
    }
}

impl FromStr for Address {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; LENGTH];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form, enough to tell addresses apart in logs.
        write!(f, "{}", &self.to_hex()[..8])
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

/// Identity of a node, derived from its public key.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId([u8; LENGTH]);

impl NodeId {
    /// The all-zero id, used as the proposer of the empty proposal.
    pub const ZERO: NodeId = NodeId([0u8; LENGTH]);

    /// Derives a node id from the node's public key.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; LENGTH];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// A random id, for tests and fixtures.
    pub fn random() -> Self {
        let mut bytes = [0u8; LENGTH];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; LENGTH] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..8])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}
