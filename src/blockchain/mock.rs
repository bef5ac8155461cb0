// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Scripted in-memory [`ChainClient`] for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{Address, Network, PubkeyHash};

use super::client::{ChainClient, ChainClientError};

/// Deterministic regtest P2PKH address for test fixture `n`.
pub fn regtest_address(n: u8) -> String {
    let hash = PubkeyHash::from_byte_array([n; 20]);
    Address::p2pkh(hash, Network::Regtest).to_string()
}

#[derive(Default)]
struct MockState {
    next_address: u8,
    address_txs: HashMap<String, Vec<String>>,
    confirmations: HashMap<String, i64>,
    failing_searches: u32,
    failing_lookups: HashSet<String>,
    search_calls: u64,
    lookup_calls: u64,
}

/// Chain client whose answers are set by the test.
#[derive(Default)]
pub struct MockChainClient {
    state: Mutex<MockState>,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `tx_id` show up in searches for `address`.
    pub fn attach_transaction(&self, address: &str, tx_id: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .address_txs
            .entry(address.to_string())
            .or_default()
            .push(tx_id.to_string());
        state.confirmations.entry(tx_id.to_string()).or_insert(0);
    }

    pub fn set_confirmations(&self, tx_id: &str, confirmations: i64) {
        self.state
            .lock()
            .unwrap()
            .confirmations
            .insert(tx_id.to_string(), confirmations);
    }

    /// Fail the next `n` searches with an RPC error.
    pub fn fail_next_searches(&self, n: u32) {
        self.state.lock().unwrap().failing_searches = n;
    }

    /// Fail every confirmation lookup for `tx_id`.
    pub fn fail_lookups_for(&self, tx_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_lookups
            .insert(tx_id.to_string());
    }

    pub fn search_calls(&self) -> u64 {
        self.state.lock().unwrap().search_calls
    }

    pub fn lookup_calls(&self) -> u64 {
        self.state.lock().unwrap().lookup_calls
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn generate_address(&self) -> Result<String, ChainClientError> {
        let mut state = self.state.lock().unwrap();
        state.next_address = state.next_address.wrapping_add(1);
        Ok(regtest_address(state.next_address))
    }

    async fn search_transactions(
        &self,
        address: &Address,
        skip: u32,
        count: u32,
    ) -> Result<Vec<String>, ChainClientError> {
        let mut state = self.state.lock().unwrap();
        state.search_calls += 1;
        if state.failing_searches > 0 {
            state.failing_searches -= 1;
            return Err(ChainClientError::Rpc("connection refused".to_string()));
        }
        Ok(state
            .address_txs
            .get(&address.to_string())
            .map(|txs| {
                txs.iter()
                    .skip(skip as usize)
                    .take(count as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_transaction_confirmations(&self, tx_id: &str) -> Result<i64, ChainClientError> {
        let mut state = self.state.lock().unwrap();
        state.lookup_calls += 1;
        if state.failing_lookups.contains(tx_id) {
            return Err(ChainClientError::Rpc("lookup failed".to_string()));
        }
        state
            .confirmations
            .get(tx_id)
            .copied()
            .ok_or_else(|| ChainClientError::TransactionNotFound(tx_id.to_string()))
    }
}
