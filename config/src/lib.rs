// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

mod consensus_config;
mod network_config;
mod storage_config;

pub use consensus_config::ConsensusConfig;
pub use network_config::NetworkConfig;
pub use storage_config::StorageConfig;

use serde::{Deserialize, Serialize};

/// Top-level node configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub consensus: ConsensusConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}
