// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{Result, Silo, SiloError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use torus_types::Address;

/// In-memory silo backend, used by tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemorySilo {
    blocks: Mutex<HashMap<Address, Vec<u8>>>,
}

impl MemorySilo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Silo for MemorySilo {
    async fn get(&self, key: Address) -> Result<Vec<u8>> {
        self.blocks
            .lock()
            .get(&key)
            .cloned()
            .ok_or(SiloError::MissingKey(key))
    }

    async fn set(
        &self,
        key: Address,
        value: Vec<u8>,
        insert: bool,
        update: bool,
    ) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let exists = blocks.contains_key(&key);
        if exists && !update {
            return Err(SiloError::AlreadyExists(key));
        }
        if !exists && !insert {
            return Err(SiloError::MissingKey(key));
        }
        blocks.insert(key, value);
        Ok(())
    }

    async fn erase(&self, key: Address) -> Result<()> {
        self.blocks
            .lock()
            .remove(&key)
            .map(|_| ())
            .ok_or(SiloError::MissingKey(key))
    }

    async fn list(&self) -> Result<Vec<Address>> {
        Ok(self.blocks.lock().keys().copied().collect())
    }
}
