// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Settlement
//!
//! Payment requests and wallet-to-wallet transfers gated on Bitcoin
//! confirmations.
//!
//! - [`PaymentSettlement`] creates payment requests, watches their receiving
//!   address and answers status queries.
//! - [`StatusPipeline`] is the single writer of payment status; the tracker
//!   and the webhook both submit into it.
//! - [`TransferSettlement`] moves ledger balances exactly once after the
//!   linked transaction is confirmed.
//! - [`SettlementNotifier`] broadcasts every status transition.
//!
//! Synchronous preconditions fail fast with a [`SettlementError`]. Failures
//! on the background paths are recorded as status transitions instead.

pub mod notify;
pub mod payments;
pub mod status;
pub mod transfers;

pub use notify::{SettlementNotifier, StatusChanged, Subject};
pub use payments::{PaymentSettlement, PaymentStatusView};
pub use status::{StatusPipeline, StatusUpdate, UpdateOutcome, UpdateSource};
pub use transfers::{
    ConfirmationPolicy, CreateTransferRequest, SettleOutcome, TransferSettlement,
    DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_MAX_ATTEMPTS,
};

use crate::blockchain::ChainClientError;
use crate::ledger::LedgerError;
use crate::storage::{DbError, PermissionDenied};
use crate::tracker::TrackerError;

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("chain error: {0}")]
    Chain(#[from] ChainClientError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("ledger error: {0}")]
    Ledger(LedgerError),

    #[error("storage error: {0}")]
    Storage(DbError),

    #[error("settlement is shutting down")]
    ShuttingDown,
}

impl From<DbError> for SettlementError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => SettlementError::NotFound(what),
            other => SettlementError::Storage(other),
        }
    }
}

impl From<LedgerError> for SettlementError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidAmount(_) | LedgerError::Validation(_) | LedgerError::AddressTaken(_) => {
                SettlementError::Validation(err.to_string())
            }
            LedgerError::NotFound(what) => SettlementError::NotFound(what),
            LedgerError::InsufficientFunds { .. } => {
                SettlementError::InsufficientFunds(err.to_string())
            }
            LedgerError::Chain(e) => SettlementError::Chain(e),
            LedgerError::Storage(e) => SettlementError::Storage(e),
            other => SettlementError::Ledger(other),
        }
    }
}

impl From<PermissionDenied> for SettlementError {
    fn from(err: PermissionDenied) -> Self {
        SettlementError::Authorization(err.to_string())
    }
}

pub type SettlementResult<T> = Result<T, SettlementError>;
