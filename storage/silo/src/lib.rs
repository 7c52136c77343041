// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! The silo: a flat address-to-bytes store. The consensus layer persists
//! every decision through this interface and never assumes anything
//! beyond single-operation atomicity.

mod filesystem;
mod memory;

pub use filesystem::FilesystemSilo;
pub use memory::MemorySilo;

use async_trait::async_trait;
use thiserror::Error;
use torus_types::Address;

#[derive(Clone, Debug, PartialEq, Error)]
pub enum SiloError {
    #[error("missing key {0}")]
    MissingKey(Address),
    #[error("key {0} already exists")]
    AlreadyExists(Address),
    #[error("io error: {0}")]
    Io(String),
}

impl From<SiloError> for torus_types::Error {
    fn from(error: SiloError) -> Self {
        match error {
            SiloError::MissingKey(address) => {
                torus_types::Error::MissingBlock(address)
            },
            other => torus_types::Error::Storage(other.to_string()),
        }
    }
}

pub type Result<T, E = SiloError> = std::result::Result<T, E>;

/// A flat key-to-bytes store.
#[async_trait]
pub trait Silo: Send + Sync + 'static {
    async fn get(&self, key: Address) -> Result<Vec<u8>>;

    /// Writes `value` under `key`. `insert` permits creating the key,
    /// `update` permits overwriting it; a flag that does not match the
    /// key's existence is a conflict.
    async fn set(
        &self,
        key: Address,
        value: Vec<u8>,
        insert: bool,
        update: bool,
    ) -> Result<()>;

    async fn erase(&self, key: Address) -> Result<()>;

    async fn list(&self) -> Result<Vec<Address>>;
}
