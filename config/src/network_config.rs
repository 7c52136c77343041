// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Timeout (in milliseconds) for establishing a connection to a peer
    pub connect_timeout_ms: u64,
    /// Soft deadline (in milliseconds) for an in-flight RPC before it is
    /// reported unavailable
    pub rpc_timeout_ms: u64,
    /// Maximum number of pending frames per connection
    pub max_channel_size: usize,
    /// Maximum accepted frame size, in bytes
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000, // 5 seconds
            rpc_timeout_ms: 20_000,    // 20 seconds
            max_channel_size: 1_024,
            max_frame_size: 64 * 1024 * 1024, // 64 MiB
        }
    }
}
