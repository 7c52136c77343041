// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsensusConfig {
    /// Desired number of replicas per block
    pub replication_factor: usize,

    /// Whether blocks are automatically re-replicated onto newly
    /// discovered peers
    pub rebalance_auto_expand: bool,
    /// Whether stored blocks are inspected for under-replication at
    /// startup
    pub rebalance_inspect: bool,
    /// Pause (in milliseconds) between address probes during the startup
    /// inspection
    pub rebalance_inspect_throttle_ms: u64,

    /// Grace period (in milliseconds) between a peer disappearing and its
    /// eviction from every quorum it belongs to
    pub node_timeout_ms: u64,

    /// Floor (in milliseconds) of the resignation backoff
    pub resign_backoff_floor_ms: u64,
    /// Ceiling (in milliseconds) of the resignation backoff
    pub resign_backoff_ceiling_ms: u64,

    /// Maximum number of decision records kept in memory
    pub decision_cache_size: usize,

    /// Whether immutable fetches prefer peers with fewer outstanding
    /// transfers
    pub balanced_transfers: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            rebalance_auto_expand: true,
            rebalance_inspect: true,
            rebalance_inspect_throttle_ms: 100,
            node_timeout_ms: 600_000, // 10 minutes
            resign_backoff_floor_ms: 10,
            resign_backoff_ceiling_ms: 10_000, // 10 seconds
            decision_cache_size: 1024,
            balanced_transfers: true,
        }
    }
}
