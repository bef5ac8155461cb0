// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Confirmation Tracker
//!
//! Background watches that poll the node for transactions touching an
//! address and report each one's confirmation depth to a callback.
//!
//! ## Strategy
//!
//! Every `poll_interval` (default 60 s) a watch:
//! 1. Decodes its address for the configured network.
//! 2. Lists recent transactions touching the address (bounded page).
//! 3. Looks up the confirmation depth of each transaction.
//! 4. Invokes the callback once per transaction with the classified depth.
//!
//! A failed decode or search backs off for `retry_backoff` (default 10 s)
//! and tries again; it never ends the watch. Delivery is at-least-once: the
//! same transaction is reported on every cycle until the watch is cancelled.
//!
//! ## Lifecycle
//!
//! Each watch runs under a child of the tracker's `CancellationToken` and is
//! recorded in a registry keyed by address. Cancelling a single watch, or the
//! tracker as a whole, stops the task at its next suspension point.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Network, Txid};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blockchain::{ChainClient, ChainClientError, ConfirmationEvent, SEARCH_PAGE_SIZE};

/// Default interval between polls of a watched address.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Default back-off after a transient decode or node error.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Callback invoked for every observed transaction.
pub type EventCallback = Arc<dyn Fn(ConfirmationEvent) + Send + Sync>;

/// Timing knobs for watches.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub page_size: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            page_size: SEARCH_PAGE_SIZE,
        }
    }
}

struct WatchEntry {
    generation: u64,
    token: CancellationToken,
}

/// Active watches keyed by address.
#[derive(Default)]
struct WatchRegistry {
    entries: Mutex<HashMap<String, WatchEntry>>,
    next_generation: AtomicU64,
}

impl WatchRegistry {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, WatchEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, address: &str, token: CancellationToken) -> Result<u64, TrackerError> {
        let mut entries = self.entries();
        if entries.contains_key(address) {
            return Err(TrackerError::AlreadyWatched(address.to_string()));
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        entries.insert(address.to_string(), WatchEntry { generation, token });
        Ok(generation)
    }

    /// Drop the entry only if it still belongs to the exiting task.
    fn release(&self, address: &str, generation: u64) {
        let mut entries = self.entries();
        if entries
            .get(address)
            .is_some_and(|entry| entry.generation == generation)
        {
            entries.remove(address);
        }
    }

    fn cancel(&self, address: &str) -> bool {
        match self.entries().remove(address) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Handle returned for a registered watch.
#[derive(Debug, Clone)]
pub struct WatchHandle {
    address: String,
    token: CancellationToken,
}

impl WatchHandle {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stop this watch. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Supervises per-address confirmation watches.
pub struct ConfirmationTracker {
    client: Arc<dyn ChainClient>,
    config: TrackerConfig,
    registry: Arc<WatchRegistry>,
    shutdown: CancellationToken,
}

impl ConfirmationTracker {
    /// Create a tracker whose watches all stop when `shutdown` is cancelled.
    pub fn new(
        client: Arc<dyn ChainClient>,
        config: TrackerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            registry: Arc::new(WatchRegistry::default()),
            shutdown,
        }
    }

    /// Start watching `address` on `network`, reporting to `on_event`.
    ///
    /// Returns as soon as the background task is spawned; the first poll
    /// happens asynchronously. Must be called from within a tokio runtime.
    pub fn watch<F>(
        &self,
        address: &str,
        network: Network,
        on_event: F,
    ) -> Result<WatchHandle, TrackerError>
    where
        F: Fn(ConfirmationEvent) + Send + Sync + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(TrackerError::ShuttingDown);
        }

        let token = self.shutdown.child_token();
        let generation = self.registry.register(address, token.clone())?;

        let task = WatchTask {
            address: address.to_string(),
            network,
            generation,
            client: Arc::clone(&self.client),
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            on_event: Arc::new(on_event),
            token: token.clone(),
        };
        tokio::spawn(task.run());

        Ok(WatchHandle {
            address: address.to_string(),
            token,
        })
    }

    /// Cancel the watch on `address`. Returns false if none was active.
    pub fn cancel(&self, address: &str) -> bool {
        let cancelled = self.registry.cancel(address);
        if cancelled {
            info!(address = %address, "Watch cancelled");
        }
        cancelled
    }

    pub fn is_watching(&self, address: &str) -> bool {
        self.registry.entries().contains_key(address)
    }

    pub fn active_watches(&self) -> usize {
        self.registry.entries().len()
    }

    /// Point lookup of a transaction's confirmation depth, outside any watch.
    pub async fn get_transaction_confirmations(
        &self,
        tx_id: &str,
    ) -> Result<i64, ChainClientError> {
        self.client.get_transaction_confirmations(tx_id).await
    }

    /// Stop every watch.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.entries().clear();
    }
}

struct WatchTask {
    address: String,
    network: Network,
    generation: u64,
    client: Arc<dyn ChainClient>,
    config: TrackerConfig,
    registry: Arc<WatchRegistry>,
    on_event: EventCallback,
    token: CancellationToken,
}

impl WatchTask {
    async fn run(self) {
        info!(
            address = %self.address,
            network = %self.network,
            interval_secs = self.config.poll_interval.as_secs(),
            "Watch starting"
        );

        loop {
            if self.token.is_cancelled() {
                break;
            }

            let wait = match self.poll_step().await {
                Ok(observed) => {
                    debug!(address = %self.address, observed, "Watch poll complete");
                    self.config.poll_interval
                }
                Err(e) => {
                    warn!(address = %self.address, error = %e, "Watch poll failed, will retry");
                    self.config.retry_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {},
                _ = self.token.cancelled() => break,
            }
        }

        info!(address = %self.address, "Watch stopped");
        self.registry.release(&self.address, self.generation);
    }

    /// One poll cycle. Returns the number of transactions reported.
    async fn poll_step(&self) -> Result<usize, TrackerError> {
        let address = decode_address(&self.address, self.network)?;
        let tx_ids = self
            .client
            .search_transactions(&address, 0, self.config.page_size)
            .await?;

        let mut observed = 0;
        for tx_id in tx_ids {
            if self.token.is_cancelled() {
                break;
            }

            if let Err(e) = Txid::from_str(&tx_id) {
                warn!(address = %self.address, tx_id = %tx_id, error = %e, "Skipping invalid tx id");
                continue;
            }

            let confirmations = match self.client.get_transaction_confirmations(&tx_id).await {
                Ok(confirmations) => confirmations,
                Err(e) => {
                    warn!(
                        address = %self.address,
                        tx_id = %tx_id,
                        error = %e,
                        "Failed to fetch confirmations"
                    );
                    continue;
                }
            };

            (self.on_event)(ConfirmationEvent::new(tx_id, confirmations));
            observed += 1;
        }

        Ok(observed)
    }
}

/// Parse `raw` and check it belongs to `network`.
pub fn decode_address(raw: &str, network: Network) -> Result<Address, TrackerError> {
    raw.parse::<Address<NetworkUnchecked>>()
        .map_err(|e| TrackerError::Decode(format!("{raw}: {e}")))?
        .require_network(network)
        .map_err(|e| TrackerError::Decode(format!("{raw}: {e}")))
}

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("address decode failed: {0}")]
    Decode(String),

    #[error("node query failed: {0}")]
    Chain(#[from] ChainClientError),

    #[error("address is already watched: {0}")]
    AlreadyWatched(String),

    #[error("tracker is shutting down")]
    ShuttingDown,
}
