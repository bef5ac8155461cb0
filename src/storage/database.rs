// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded settlement database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `wallets`: wallet_id → serialized PayoutWallet
//! - `wallet_addresses`: address → wallet_id (global uniqueness)
//! - `default_wallets`: `user_id|currency` → wallet_id (one default per pair)
//! - `payments`: payment_id → serialized Payment
//! - `transfers`: transfer_id → serialized Transfer
//! - `sequences`: sequence name → last allocated id
//!
//! redb admits one write transaction at a time, so every read-modify-write
//! below is serialized against concurrent writers touching the same rows.

use std::path::Path;

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};

// =============================================================================
// Table Definitions
// =============================================================================

pub(crate) const WALLETS: TableDefinition<u64, &[u8]> = TableDefinition::new("wallets");

pub(crate) const WALLET_ADDRESSES: TableDefinition<&str, u64> =
    TableDefinition::new("wallet_addresses");

pub(crate) const DEFAULT_WALLETS: TableDefinition<&str, u64> =
    TableDefinition::new("default_wallets");

pub(crate) const PAYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("payments");

pub(crate) const TRANSFERS: TableDefinition<u64, &[u8]> = TableDefinition::new("transfers");

const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),
}

pub type DbResult<T> = Result<T, DbError>;

// =============================================================================
// SettlementDb
// =============================================================================

/// Embedded ACID store for wallets, payments and transfers.
pub struct SettlementDb {
    db: Database,
}

impl SettlementDb {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(WALLETS)?;
            let _ = write_txn.open_table(WALLET_ADDRESSES)?;
            let _ = write_txn.open_table(DEFAULT_WALLETS)?;
            let _ = write_txn.open_table(PAYMENTS)?;
            let _ = write_txn.open_table(TRANSFERS)?;
            let _ = write_txn.open_table(SEQUENCES)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    pub(crate) fn begin_write(&self) -> DbResult<WriteTransaction> {
        Ok(self.db.begin_write()?)
    }

    pub(crate) fn begin_read(&self) -> DbResult<ReadTransaction> {
        Ok(self.db.begin_read()?)
    }

    /// Cheap read used by readiness probes.
    pub fn health_check(&self) -> DbResult<()> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(SEQUENCES)?;
        let _ = table.get("wallets")?;
        Ok(())
    }
}

/// Allocate the next id of `sequence` inside an open write transaction.
///
/// Ids start at 1. The bump commits or aborts with the caller's transaction.
pub(crate) fn next_id(write_txn: &WriteTransaction, sequence: &str) -> DbResult<u64> {
    let mut table = write_txn.open_table(SEQUENCES)?;
    let current = table.get(sequence)?.map(|v| v.value()).unwrap_or(0);
    let next = current + 1;
    table.insert(sequence, next)?;
    Ok(next)
}

/// Composite key for the default-wallet index.
pub(crate) fn default_key(user_id: u64, currency: &str) -> String {
    format!("{user_id}|{}", currency.to_ascii_uppercase())
}
