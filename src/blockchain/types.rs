// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Blockchain types and constants.

use bitcoin::Network;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Confirmation depth at which a transaction is treated as final.
pub const CONFIRMATION_THRESHOLD: i64 = 6;

/// Maximum number of transactions fetched per address per poll.
pub const SEARCH_PAGE_SIZE: u32 = 10;

/// Supported network names, as accepted in configuration.
pub const NETWORK_MAINNET: &str = "mainnet";
pub const NETWORK_TESTNET: &str = "testnet";
pub const NETWORK_SIGNET: &str = "signet";
pub const NETWORK_REGTEST: &str = "regtest";

/// Resolve a configured network name to bitcoin network parameters.
///
/// Unknown or empty names fall back to testnet.
pub fn network_from_name(raw: &str) -> Network {
    match raw.trim().to_ascii_lowercase().as_str() {
        NETWORK_MAINNET | "bitcoin" => Network::Bitcoin,
        NETWORK_SIGNET => Network::Signet,
        NETWORK_REGTEST => Network::Regtest,
        _ => Network::Testnet,
    }
}

/// Confirmation classification for an observed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    /// Seen by the node but not yet mined
    Pending,
    /// Mined, fewer than [`CONFIRMATION_THRESHOLD`] blocks deep
    PendingConfirmation,
    /// At least [`CONFIRMATION_THRESHOLD`] blocks deep
    Confirmed,
}

impl ConfirmationStatus {
    /// Classify a confirmation depth.
    ///
    /// The threshold is monotonic: anything at or past it is confirmed.
    /// Negative depths (conflicted transactions) count as pending.
    pub fn from_confirmations(confirmations: i64) -> Self {
        if confirmations >= CONFIRMATION_THRESHOLD {
            Self::Confirmed
        } else if confirmations > 0 {
            Self::PendingConfirmation
        } else {
            Self::Pending
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PendingConfirmation => "pending_confirmation",
            Self::Confirmed => "confirmed",
        }
    }
}

impl std::fmt::Display for ConfirmationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation of a transaction touching a watched address.
///
/// Produced once per transaction per poll cycle; never persisted itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationEvent {
    /// On-chain transaction id (hex)
    pub tx_id: String,
    /// Confirmation depth at observation time
    pub confirmations: i64,
    /// Classification derived from `confirmations`
    pub status: ConfirmationStatus,
}

impl ConfirmationEvent {
    pub fn new(tx_id: impl Into<String>, confirmations: i64) -> Self {
        Self {
            tx_id: tx_id.into(),
            confirmations,
            status: ConfirmationStatus::from_confirmations(confirmations),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_uses_monotonic_threshold() {
        assert_eq!(ConfirmationStatus::from_confirmations(0), ConfirmationStatus::Pending);
        assert_eq!(
            ConfirmationStatus::from_confirmations(3),
            ConfirmationStatus::PendingConfirmation
        );
        assert_eq!(
            ConfirmationStatus::from_confirmations(5),
            ConfirmationStatus::PendingConfirmation
        );
        assert_eq!(ConfirmationStatus::from_confirmations(6), ConfirmationStatus::Confirmed);
        assert_eq!(ConfirmationStatus::from_confirmations(11), ConfirmationStatus::Confirmed);
    }

    #[test]
    fn conflicted_depth_is_pending() {
        assert_eq!(ConfirmationStatus::from_confirmations(-1), ConfirmationStatus::Pending);
    }

    #[test]
    fn event_derives_status() {
        let event = ConfirmationEvent::new("abc", 2);
        assert_eq!(event.status, ConfirmationStatus::PendingConfirmation);
        assert_eq!(event.status.to_string(), "pending_confirmation");
    }

    #[test]
    fn network_names_resolve() {
        assert_eq!(network_from_name("mainnet"), Network::Bitcoin);
        assert_eq!(network_from_name("REGTEST"), Network::Regtest);
        assert_eq!(network_from_name("signet"), Network::Signet);
        assert_eq!(network_from_name("testnet"), Network::Testnet);
        assert_eq!(network_from_name("nonsense"), Network::Testnet);
        assert_eq!(network_from_name(""), Network::Testnet);
    }
}
