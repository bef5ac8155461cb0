// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Bitcoin node integration.
//!
//! This module provides:
//! - The [`ChainClient`] read path used by the tracker and transfer settlement
//! - A JSON-RPC implementation for btcd-compatible nodes
//! - Confirmation classification and network parameters

pub mod client;
#[cfg(test)]
pub mod mock;
pub mod types;

pub use client::{ChainClient, ChainClientError, RpcChainClient, RpcConfig};
pub use types::*;
