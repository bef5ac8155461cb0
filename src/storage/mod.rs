// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Settlement Storage
//!
//! Persistent state lives in a single redb file under `DATA_DIR`.
//!
//! ## Storage Layout
//!
//! ```text
//! {DATA_DIR}/
//!   settlement.redb
//!     wallets, wallet_addresses, default_wallets
//!     payments
//!     transfers
//!     sequences
//! ```
//!
//! ## Consistency
//!
//! - Every balance change is a read-modify-write inside one write transaction
//! - The default-wallet swap touches the flag and the index atomically
//! - The transfer settlement latch is a compare-and-set

pub mod database;
pub mod ownership;
pub mod repository;

pub use database::{DbError, DbResult, SettlementDb};
pub use ownership::{OwnedResource, OwnershipEnforcer, PermissionDenied};
pub use repository::{
    NewTransfer, NewWallet, Payment, PaymentRepository, PaymentStatus, PayoutWallet, Transfer,
    TransferRepository, TransferStatus, TransferType, WalletRepository, WalletUpdate,
};

/// File name of the settlement database inside `DATA_DIR`.
pub const DATABASE_FILE: &str = "settlement.redb";
