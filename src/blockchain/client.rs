// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Bitcoin node client for confirmation lookups.
//!
//! [`ChainClient`] is the read path shared by every watch and every transfer
//! settlement. It is stateless apart from the HTTP connection pool, so one
//! instance is safe to share across tasks behind an `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::Address;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};

/// JSON-RPC error code for "no information available" (unknown tx/address).
const RPC_NO_INFORMATION: i64 = -5;

/// Request timeout for a single node call.
const RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// Read/allocate operations the settlement core needs from a Bitcoin node.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Ask the node wallet for a fresh receiving address.
    async fn generate_address(&self) -> Result<String, ChainClientError>;

    /// Ids of recent transactions touching `address`, at most `count`.
    async fn search_transactions(
        &self,
        address: &Address,
        skip: u32,
        count: u32,
    ) -> Result<Vec<String>, ChainClientError>;

    /// Current confirmation depth of a transaction.
    async fn get_transaction_confirmations(&self, tx_id: &str) -> Result<i64, ChainClientError>;
}

/// Connection settings for the node's JSON-RPC endpoint.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub url: String,
    pub user: String,
    pub pass: String,
}

/// JSON-RPC client for a btcd-compatible node (address index enabled).
pub struct RpcChainClient {
    url: url::Url,
    user: String,
    pass: String,
    http: Client,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    txid: String,
}

#[derive(Debug, Deserialize)]
struct RawTransactionInfo {
    /// Absent while the transaction is still in the mempool.
    #[serde(default)]
    confirmations: i64,
}

impl RpcChainClient {
    pub fn new(config: &RpcConfig) -> Result<Self, ChainClientError> {
        let url: url::Url = config
            .url
            .parse()
            .map_err(|e: url::ParseError| ChainClientError::InvalidRpcUrl(e.to_string()))?;

        let http = Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|e| ChainClientError::Rpc(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url,
            user: config.user.clone(),
            pass: config.pass.clone(),
            http,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ChainClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(self.url.clone())
            .basic_auth(&self.user, Some(&self.pass))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainClientError::Rpc(format!("{method}: {e}")))?;

        // Nodes answer RPC-level failures with a non-2xx status and a JSON body,
        // so decode first and only then look at the status.
        let status = response.status();
        let decoded: RpcResponse<T> = response.json().await.map_err(|e| {
            ChainClientError::InvalidResponse(format!("{method} (HTTP {status}): {e}"))
        })?;

        if let Some(error) = decoded.error {
            return Err(ChainClientError::Node {
                code: error.code,
                message: error.message,
            });
        }

        decoded
            .result
            .ok_or_else(|| ChainClientError::InvalidResponse(format!("{method}: empty result")))
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn generate_address(&self) -> Result<String, ChainClientError> {
        self.call("getnewaddress", json!([])).await
    }

    async fn search_transactions(
        &self,
        address: &Address,
        skip: u32,
        count: u32,
    ) -> Result<Vec<String>, ChainClientError> {
        let result: Result<Vec<SearchEntry>, _> = self
            .call(
                "searchrawtransactions",
                json!([address.to_string(), 1, skip, count, 0, false]),
            )
            .await;

        match result {
            Ok(entries) => Ok(entries.into_iter().map(|e| e.txid).collect()),
            // An address with no history is reported as an error, not an empty list.
            Err(ChainClientError::Node { code, .. }) if code == RPC_NO_INFORMATION => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn get_transaction_confirmations(&self, tx_id: &str) -> Result<i64, ChainClientError> {
        let result: Result<RawTransactionInfo, _> =
            self.call("getrawtransaction", json!([tx_id, 1])).await;

        match result {
            Ok(info) => Ok(info.confirmations),
            Err(ChainClientError::Node { code, .. }) if code == RPC_NO_INFORMATION => {
                Err(ChainClientError::TransactionNotFound(tx_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

/// Errors that can occur while talking to the node.
#[derive(Debug, thiserror::Error)]
pub enum ChainClientError {
    #[error("Invalid RPC URL: {0}")]
    InvalidRpcUrl(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Node error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("Invalid RPC response: {0}")]
    InvalidResponse(String),
}
