// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{Result, Silo, SiloError};
use async_trait::async_trait;
use std::{io::ErrorKind, path::PathBuf};
use torus_types::Address;
use tracing::warn;

/// Filesystem silo backend: one file per address, hex-named, in a flat
/// directory.
#[derive(Debug)]
pub struct FilesystemSilo {
    root: PathBuf,
}

impl FilesystemSilo {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(io_error)?;
        Ok(Self { root })
    }

    fn path(&self, key: &Address) -> PathBuf {
        self.root.join(key.to_hex())
    }
}

fn io_error(error: std::io::Error) -> SiloError {
    SiloError::Io(error.to_string())
}

#[async_trait]
impl Silo for FilesystemSilo {
    async fn get(&self, key: Address) -> Result<Vec<u8>> {
        match tokio::fs::read(self.path(&key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(SiloError::MissingKey(key))
            },
            Err(e) => Err(io_error(e)),
        }
    }

    async fn set(
        &self,
        key: Address,
        value: Vec<u8>,
        insert: bool,
        update: bool,
    ) -> Result<()> {
        let path = self.path(&key);
        let exists = tokio::fs::try_exists(&path).await.map_err(io_error)?;
        if exists && !update {
            return Err(SiloError::AlreadyExists(key));
        }
        if !exists && !insert {
            return Err(SiloError::MissingKey(key));
        }
        // Write-then-rename so a crash never leaves a torn value.
        let tmp = self.root.join(format!(".{}.tmp", key.to_hex()));
        tokio::fs::write(&tmp, &value).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_error)
    }

    async fn erase(&self, key: Address) -> Result<()> {
        match tokio::fs::remove_file(self.path(&key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(SiloError::MissingKey(key))
            },
            Err(e) => Err(io_error(e)),
        }
    }

    async fn list(&self) -> Result<Vec<Address>> {
        let mut entries =
            tokio::fs::read_dir(&self.root).await.map_err(io_error)?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match name.parse::<Address>() {
                Ok(key) => keys.push(key),
                // Temp files and strays are not addresses.
                Err(_) => {
                    if !name.starts_with('.') {
                        warn!(file = name, "unrecognized file in silo");
                    }
                },
            }
        }
        Ok(keys)
    }
}
