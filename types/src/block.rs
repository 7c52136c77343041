// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

//! Block flavors and their validation rules.
//!
//! Immutable and named blocks are content-addressed and replicated
//! directly; owner-keyed and ACL blocks are mutable, versioned, signed,
//! and linearized through Paxos. Validation here is the last line of
//! defense: every peer that persists a value runs it.

use crate::{address::Address, error::Error};
use ed25519_dalek::{Keypair, PublicKey, Signature, Signer, Verifier};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a store operation treats pre-existing state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreMode {
    Insert,
    Update,
}

/// One unit of storage.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub enum Block {
    Immutable(ImmutableBlock),
    OwnerKeyed(OwnerKeyedBlock),
    Acl(AclBlock),
    Named(NamedBlock),
}

impl Block {
    pub fn address(&self) -> Address {
        match self {
            Block::Immutable(b) => b.address,
            Block::OwnerKeyed(b) => b.address,
            Block::Acl(b) => b.address,
            Block::Named(b) => b.address,
        }
    }

    /// Version of the signed content. Content-addressed blocks never
    /// change, so they report version 0.
    pub fn version(&self) -> u64 {
        match self {
            Block::Immutable(_) | Block::Named(_) => 0,
            Block::OwnerKeyed(b) => b.version,
            Block::Acl(b) => b.version,
        }
    }

    pub fn is_mutable(&self) -> bool {
        self.address().is_mutable()
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Block::Immutable(b) => &b.payload,
            Block::OwnerKeyed(b) => &b.payload,
            Block::Acl(b) => &b.payload,
            Block::Named(b) => &b.payload,
        }
    }

    pub fn owner(&self) -> &PublicKey {
        match self {
            Block::Immutable(b) => &b.owner,
            Block::OwnerKeyed(b) => &b.owner,
            Block::Acl(b) => &b.owner,
            Block::Named(b) => &b.owner,
        }
    }

    /// Forces the version of the next seal on mutable flavors. No-op on
    /// content-addressed blocks.
    pub fn hint_version(&mut self, version: u64) {
        match self {
            Block::OwnerKeyed(b) => b.hint_version(version),
            Block::Acl(b) => b.hint_version(version),
            Block::Immutable(_) | Block::Named(_) => {},
        }
    }

    /// Re-signs a mutable block with `keypair` at the hinted (or next)
    /// version. No-op on content-addressed blocks.
    pub fn seal(&mut self, keypair: &Keypair) {
        match self {
            Block::OwnerKeyed(b) => b.seal(keypair),
            Block::Acl(b) => b.seal(keypair),
            Block::Immutable(_) | Block::Named(_) => {},
        }
    }

    /// Validates the block in isolation: address derivation for
    /// content-addressed flavors, signatures and writer authority for
    /// mutable ones.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            Block::Immutable(b) => b.validate(),
            Block::OwnerKeyed(b) => b.validate(),
            Block::Acl(b) => b.validate(),
            Block::Named(b) => b.validate(),
        }
    }

    /// Validates this block as a successor of `previous`.
    pub fn validate_against(&self, previous: &Block) -> Result<(), Error> {
        match (previous, self) {
            (Block::Immutable(prev), Block::Immutable(new)) => {
                if prev.payload != new.payload {
                    return Err(Error::ValidationFailed(
                        "different payload at a content address".into(),
                    ));
                }
                Ok(())
            },
            (Block::Named(prev), Block::Named(new)) => {
                if prev.payload != new.payload {
                    return Err(Error::ValidationFailed(
                        "named block is immutable after its first write".into(),
                    ));
                }
                Ok(())
            },
            (Block::OwnerKeyed(prev), Block::OwnerKeyed(new)) => {
                if new.owner != prev.owner {
                    return Err(Error::ValidationFailed(
                        "owner key changed".into(),
                    ));
                }
                check_version_progress(prev.version, new.version, previous)
            },
            (Block::Acl(prev), Block::Acl(new)) => {
                if new.owner != prev.owner {
                    return Err(Error::ValidationFailed(
                        "owner key changed".into(),
                    ));
                }
                // Write authority comes from the *stored* ACL, not the one
                // the writer claims.
                if !prev.allows_write(&new.writer) {
                    return Err(Error::ValidationFailed(
                        "writer not authorized by the current ACL".into(),
                    ));
                }
                if new.acl != prev.acl && new.writer != new.owner {
                    return Err(Error::ValidationFailed(
                        "only the owner may change the ACL".into(),
                    ));
                }
                check_version_progress(prev.version, new.version, previous)
            },
            _ => Err(Error::ValidationFailed("block flavor changed".into())),
        }
    }

    /// Validates a removal request against this block, the last value the
    /// local peer accepted.
    pub fn validate_remove(&self, rs: &RemoveSignature) -> Result<(), Error> {
        if rs.signer != *self.owner() {
            return Err(Error::ValidationFailed(
                "removal is restricted to the block owner".into(),
            ));
        }
        rs.verify(self.address())
    }
}

fn check_version_progress(
    previous: u64,
    new: u64,
    current: &Block,
) -> Result<(), Error> {
    if new <= previous {
        Err(Error::Conflict {
            reason: format!("version {} does not supersede {}", new, previous),
            current: Some(Box::new(current.clone())),
        })
    } else {
        Ok(())
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Block::Immutable(b) => {
                write!(f, "ImmutableBlock({}, {} bytes)", b.address, b.payload.len())
            },
            Block::OwnerKeyed(b) => write!(
                f,
                "OwnerKeyedBlock({}, v{}, {} bytes)",
                b.address,
                b.version,
                b.payload.len()
            ),
            Block::Acl(b) => write!(
                f,
                "AclBlock({}, v{}, {} entries, {} bytes)",
                b.address,
                b.version,
                b.acl.len(),
                b.payload.len()
            ),
            Block::Named(b) => write!(
                f,
                "NamedBlock({}, {:?}, {} bytes)",
                b.address,
                b.name,
                b.payload.len()
            ),
        }
    }
}

/// Content-addressed block: `address = sha3(owner, payload)`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ImmutableBlock {
    pub address: Address,
    pub owner: PublicKey,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl ImmutableBlock {
    pub fn new(owner: &PublicKey, payload: Vec<u8>) -> Self {
        let address = Address::immutable(owner, &payload);
        Self { address, owner: *owner, payload }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.address != Address::immutable(&self.owner, &self.payload) {
            return Err(Error::ValidationFailed(
                "content address does not match payload".into(),
            ));
        }
        Ok(())
    }
}

/// Mutable block signed by its owner key on every version.
#[derive(Clone, Serialize, Deserialize)]
pub struct OwnerKeyedBlock {
    pub address: Address,
    pub owner: PublicKey,
    pub version: u64,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub signature: Signature,
    /// Version the next seal must use, set when a fetch observed a more
    /// recent proposal than the signed content. Never serialized.
    #[serde(skip)]
    next_version: Option<u64>,
}

impl OwnerKeyedBlock {
    /// Creates a fresh block at a random mutable address, sealed empty at
    /// version 0.
    pub fn new(owner: &Keypair) -> Self {
        let address = Address::random_mutable();
        let payload = Vec::new();
        let signature =
            owner.sign(&owner_keyed_signing_bytes(&address, 0, &payload));
        Self {
            address,
            owner: owner.public,
            version: 0,
            payload,
            signature,
            next_version: None,
        }
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    /// Forces the version of the next seal. Used after a fetch to
    /// guarantee that writers supersede the latest chosen proposal.
    pub fn hint_version(&mut self, version: u64) {
        self.next_version = Some(version);
    }

    /// Signs the current payload at the next version.
    pub fn seal(&mut self, owner: &Keypair) {
        let version =
            self.next_version.take().unwrap_or(self.version + 1);
        self.seal_at(owner, version);
    }

    /// Signs the current payload at an explicit version.
    pub fn seal_at(&mut self, owner: &Keypair, version: u64) {
        self.version = version;
        self.next_version = None;
        self.signature = owner.sign(&owner_keyed_signing_bytes(
            &self.address,
            self.version,
            &self.payload,
        ));
    }

    fn validate(&self) -> Result<(), Error> {
        if !self.address.is_mutable() {
            return Err(Error::ValidationFailed(
                "owner-keyed block at an immutable address".into(),
            ));
        }
        self.owner
            .verify(
                &owner_keyed_signing_bytes(
                    &self.address,
                    self.version,
                    &self.payload,
                ),
                &self.signature,
            )
            .map_err(|_| Error::ValidationFailed("bad owner signature".into()))
    }
}

impl PartialEq for OwnerKeyedBlock {
    fn eq(&self, other: &Self) -> bool {
        // Sealed content only; the seal hint is transient.
        self.address == other.address
            && self.owner == other.owner
            && self.version == other.version
            && self.payload == other.payload
            && self.signature == other.signature
    }
}

/// One principal's rights in an ACL.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AclEntry {
    pub principal: PublicKey,
    pub read: bool,
    pub write: bool,
}

/// Mutable block carrying a group ACL; any authorized writer may sign a
/// new version.
#[derive(Clone, Serialize, Deserialize)]
pub struct AclBlock {
    pub address: Address,
    pub owner: PublicKey,
    pub version: u64,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub acl: Vec<AclEntry>,
    pub writer: PublicKey,
    pub signature: Signature,
    #[serde(skip)]
    next_version: Option<u64>,
}

impl AclBlock {
    pub fn new(owner: &Keypair) -> Self {
        let address = Address::random_mutable();
        let acl = Vec::new();
        let payload = Vec::new();
        let signature = owner
            .sign(&acl_signing_bytes(&address, 0, &payload, &acl));
        Self {
            address,
            owner: owner.public,
            version: 0,
            payload,
            acl,
            writer: owner.public,
            signature,
            next_version: None,
        }
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    pub fn set_acl(&mut self, acl: Vec<AclEntry>) {
        self.acl = acl;
    }

    pub fn hint_version(&mut self, version: u64) {
        self.next_version = Some(version);
    }

    /// Signs the current payload and ACL as `writer` at the next version.
    pub fn seal(&mut self, writer: &Keypair) {
        let version =
            self.next_version.take().unwrap_or(self.version + 1);
        self.version = version;
        self.writer = writer.public;
        self.signature = writer.sign(&acl_signing_bytes(
            &self.address,
            self.version,
            &self.payload,
            &self.acl,
        ));
    }

    /// Whether `key` may write under this block's ACL.
    pub fn allows_write(&self, key: &PublicKey) -> bool {
        *key == self.owner
            || self
                .acl
                .iter()
                .any(|entry| entry.write && entry.principal == *key)
    }

    /// Whether `key` may read under this block's ACL.
    pub fn allows_read(&self, key: &PublicKey) -> bool {
        *key == self.owner
            || self
                .acl
                .iter()
                .any(|entry| (entry.read || entry.write) && entry.principal == *key)
    }

    fn validate(&self) -> Result<(), Error> {
        if !self.address.is_mutable() {
            return Err(Error::ValidationFailed(
                "ACL block at an immutable address".into(),
            ));
        }
        if !self.allows_write(&self.writer) {
            return Err(Error::ValidationFailed(
                "writer not present in the ACL".into(),
            ));
        }
        self.writer
            .verify(
                &acl_signing_bytes(
                    &self.address,
                    self.version,
                    &self.payload,
                    &self.acl,
                ),
                &self.signature,
            )
            .map_err(|_| Error::ValidationFailed("bad writer signature".into()))
    }
}

impl PartialEq for AclBlock {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.owner == other.owner
            && self.version == other.version
            && self.payload == other.payload
            && self.acl == other.acl
            && self.writer == other.writer
            && self.signature == other.signature
    }
}

/// Content-addressed by (owner, name); immutable after the first write and
/// deletable only by its owner.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedBlock {
    pub address: Address,
    pub owner: PublicKey,
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub signature: Signature,
}

impl NamedBlock {
    pub fn new(owner: &Keypair, name: String, payload: Vec<u8>) -> Self {
        let address = Address::named(&owner.public, &name);
        let signature =
            owner.sign(&named_signing_bytes(&address, &name, &payload));
        Self { address, owner: owner.public, name, payload, signature }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.address != Address::named(&self.owner, &self.name) {
            return Err(Error::ValidationFailed(
                "named address does not match owner and name".into(),
            ));
        }
        self.owner
            .verify(
                &named_signing_bytes(&self.address, &self.name, &self.payload),
                &self.signature,
            )
            .map_err(|_| Error::ValidationFailed("bad owner signature".into()))
    }
}

/// Detached signature authorizing the removal of a block.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveSignature {
    pub signer: PublicKey,
    pub signature: Signature,
}

impl RemoveSignature {
    pub fn new(signer: &Keypair, address: Address) -> Self {
        Self {
            signer: signer.public,
            signature: signer.sign(&remove_signing_bytes(&address)),
        }
    }

    fn verify(&self, address: Address) -> Result<(), Error> {
        self.signer
            .verify(&remove_signing_bytes(&address), &self.signature)
            .map_err(|_| {
                Error::ValidationFailed("bad removal signature".into())
            })
    }
}

impl fmt::Debug for RemoveSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoveSignature({})", hex::encode(&self.signer.as_bytes()[..4]))
    }
}

fn owner_keyed_signing_bytes(
    address: &Address,
    version: u64,
    payload: &[u8],
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(payload.len() + 48);
    bytes.extend_from_slice(b"torus:okb");
    bytes.extend_from_slice(address.as_bytes());
    bytes.extend_from_slice(&version.to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

fn acl_signing_bytes(
    address: &Address,
    version: u64,
    payload: &[u8],
    acl: &[AclEntry],
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(payload.len() + 48 + acl.len() * 34);
    bytes.extend_from_slice(b"torus:acb");
    bytes.extend_from_slice(address.as_bytes());
    bytes.extend_from_slice(&version.to_le_bytes());
    for entry in acl {
        bytes.extend_from_slice(entry.principal.as_bytes());
        bytes.push(entry.read as u8);
        bytes.push(entry.write as u8);
    }
    bytes.extend_from_slice(payload);
    bytes
}

fn named_signing_bytes(address: &Address, name: &str, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(payload.len() + name.len() + 48);
    bytes.extend_from_slice(b"torus:nb");
    bytes.extend_from_slice(address.as_bytes());
    bytes.extend_from_slice(name.as_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

fn remove_signing_bytes(address: &Address) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(48);
    bytes.extend_from_slice(b"torus:remove");
    bytes.extend_from_slice(address.as_bytes());
    bytes
}
