// Copyright © Torus Contributors
// SPDX-License-Identifier: Apache-2.0

pub mod client;
pub mod server;
