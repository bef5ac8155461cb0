// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Wallet-to-wallet transfer repository.
//!
//! `is_processed` is the settlement latch. It only ever flips from `false`
//! to `true`, and only through the compare-and-set helpers below, each of
//! which runs in a single write transaction.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, Table};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::super::database::{next_id, DbError, DbResult, SettlementDb, TRANSFERS};

const TRANSFER_SEQUENCE: &str = "transfers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction from the sender's perspective. Transfers are always debits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    Debit,
}

/// A ledger transfer waiting on an on-chain confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Transfer {
    pub id: u64,
    pub source_wallet_id: u64,
    /// Receiver resolved from `receiver_address` at creation
    pub receiver_wallet_id: u64,
    pub transfer_type: TransferType,
    /// Amount in minor units
    pub amount: i64,
    pub price_currency: String,
    pub pay_currency: String,
    pub comment: String,
    pub sender_id: u64,
    pub receiver_address: String,
    pub status: TransferStatus,
    pub is_processed: bool,
    /// On-chain transaction whose depth gates settlement
    pub linked_tx_id: Option<String>,
    /// Confirmation checks performed so far
    pub check_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl super::super::OwnedResource for Transfer {
    fn owner_user_id(&self) -> u64 {
        self.sender_id
    }

    fn resource_label(&self) -> String {
        format!("transfer {}", self.id)
    }
}

/// Fields for a transfer about to be created.
#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub source_wallet_id: u64,
    pub receiver_wallet_id: u64,
    pub amount: i64,
    pub price_currency: String,
    pub pay_currency: String,
    pub comment: String,
    pub sender_id: u64,
    pub receiver_address: String,
    pub linked_tx_id: Option<String>,
}

type TransferTable<'txn> = Table<'txn, u64, &'static [u8]>;

fn load_transfer(
    table: &impl ReadableTable<u64, &'static [u8]>,
    transfer_id: u64,
) -> DbResult<Transfer> {
    match table.get(transfer_id)? {
        Some(value) => Ok(serde_json::from_slice(value.value())?),
        None => Err(DbError::NotFound(format!("Transfer {transfer_id}"))),
    }
}

fn put_transfer(table: &mut TransferTable<'_>, transfer: &Transfer) -> DbResult<()> {
    let json = serde_json::to_vec(transfer)?;
    table.insert(transfer.id, json.as_slice())?;
    Ok(())
}

/// Repository for transfers.
pub struct TransferRepository<'a> {
    db: &'a SettlementDb,
}

impl<'a> TransferRepository<'a> {
    pub fn new(db: &'a SettlementDb) -> Self {
        Self { db }
    }

    /// Persist a new transfer as `pending`, unprocessed.
    pub fn create(&self, new: &NewTransfer) -> DbResult<Transfer> {
        let write_txn = self.db.begin_write()?;
        let transfer = {
            let id = next_id(&write_txn, TRANSFER_SEQUENCE)?;
            let now = Utc::now();
            let transfer = Transfer {
                id,
                source_wallet_id: new.source_wallet_id,
                receiver_wallet_id: new.receiver_wallet_id,
                transfer_type: TransferType::Debit,
                amount: new.amount,
                price_currency: new.price_currency.clone(),
                pay_currency: new.pay_currency.clone(),
                comment: new.comment.clone(),
                sender_id: new.sender_id,
                receiver_address: new.receiver_address.clone(),
                status: TransferStatus::Pending,
                is_processed: false,
                linked_tx_id: new.linked_tx_id.clone(),
                check_attempts: 0,
                created_at: now,
                updated_at: now,
            };
            let mut table = write_txn.open_table(TRANSFERS)?;
            put_transfer(&mut table, &transfer)?;
            transfer
        };
        write_txn.commit()?;
        Ok(transfer)
    }

    pub fn get(&self, transfer_id: u64) -> DbResult<Transfer> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSFERS)?;
        load_transfer(&table, transfer_id)
    }

    /// Transfers drawn from a wallet, oldest first.
    pub fn list_by_wallet(&self, wallet_id: u64) -> DbResult<Vec<Transfer>> {
        self.list_where(|t| t.source_wallet_id == wallet_id)
    }

    /// Transfers sent by a user, oldest first.
    pub fn list_by_sender(&self, sender_id: u64) -> DbResult<Vec<Transfer>> {
        self.list_where(|t| t.sender_id == sender_id)
    }

    pub fn list_unprocessed(&self) -> DbResult<Vec<Transfer>> {
        self.list_where(|t| !t.is_processed)
    }

    fn list_where(&self, keep: impl Fn(&Transfer) -> bool) -> DbResult<Vec<Transfer>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSFERS)?;

        let mut transfers = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let transfer: Transfer = serde_json::from_slice(value.value())?;
            if keep(&transfer) {
                transfers.push(transfer);
            }
        }
        Ok(transfers)
    }

    /// Apply `f` to an unprocessed transfer in one write transaction.
    ///
    /// Returns `None` without writing if the transfer is already processed.
    fn modify_unprocessed(
        &self,
        transfer_id: u64,
        f: impl FnOnce(&mut Transfer),
    ) -> DbResult<Option<Transfer>> {
        let write_txn = self.db.begin_write()?;
        let transfer = {
            let mut table = write_txn.open_table(TRANSFERS)?;
            let mut transfer = load_transfer(&table, transfer_id)?;
            if transfer.is_processed {
                None
            } else {
                f(&mut transfer);
                transfer.updated_at = Utc::now();
                put_transfer(&mut table, &transfer)?;
                Some(transfer)
            }
        };
        if transfer.is_some() {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(transfer)
    }

    /// Flip the latch before moving funds. Only one caller ever gets `Some`.
    pub fn claim_for_settlement(&self, transfer_id: u64) -> DbResult<Option<Transfer>> {
        self.modify_unprocessed(transfer_id, |t| t.is_processed = true)
    }

    /// Flip the latch and record a final status in the same transaction.
    ///
    /// Returns `false` if another attempt already processed the transfer.
    pub fn close(&self, transfer_id: u64, status: TransferStatus) -> DbResult<bool> {
        let closed = self.modify_unprocessed(transfer_id, |t| {
            t.is_processed = true;
            t.status = status;
        })?;
        Ok(closed.is_some())
    }

    /// Count one confirmation check on a still-unprocessed transfer.
    pub fn record_attempt(&self, transfer_id: u64) -> DbResult<Option<Transfer>> {
        self.modify_unprocessed(transfer_id, |t| t.check_attempts += 1)
    }

    /// Link the on-chain transaction whose depth gates settlement.
    pub fn link_transaction(&self, transfer_id: u64, tx_id: &str) -> DbResult<Option<Transfer>> {
        self.modify_unprocessed(transfer_id, |t| t.linked_tx_id = Some(tx_id.to_string()))
    }

    /// Set the final status of a claimed transfer.
    pub fn update_status(&self, transfer_id: u64, status: TransferStatus) -> DbResult<Transfer> {
        let write_txn = self.db.begin_write()?;
        let transfer = {
            let mut table = write_txn.open_table(TRANSFERS)?;
            let mut transfer = load_transfer(&table, transfer_id)?;
            transfer.status = status;
            transfer.updated_at = Utc::now();
            put_transfer(&mut table, &transfer)?;
            transfer
        };
        write_txn.commit()?;
        Ok(transfer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn temp_db() -> (SettlementDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = SettlementDb::open(&dir.path().join("transfers.redb")).unwrap();
        (db, dir)
    }

    fn new_transfer(source: u64, sender: u64) -> NewTransfer {
        NewTransfer {
            source_wallet_id: source,
            receiver_wallet_id: 99,
            amount: 40,
            price_currency: "BTC".to_string(),
            pay_currency: "BTC".to_string(),
            comment: "rent".to_string(),
            sender_id: sender,
            receiver_address: "receiver".to_string(),
            linked_tx_id: Some("ab".repeat(32)),
        }
    }

    #[test]
    fn create_starts_pending_and_unprocessed() {
        let (db, _dir) = temp_db();
        let repo = TransferRepository::new(&db);

        let transfer = repo.create(&new_transfer(1, 10)).unwrap();
        assert_eq!(transfer.id, 1);
        assert_eq!(transfer.status, TransferStatus::Pending);
        assert_eq!(transfer.transfer_type, TransferType::Debit);
        assert_eq!(serde_json::to_value(transfer.transfer_type).unwrap(), "debit");
        assert!(!transfer.is_processed);
        assert_eq!(repo.get(1).unwrap(), transfer);
        assert!(matches!(repo.get(2), Err(DbError::NotFound(_))));
    }

    #[test]
    fn listing_filters() {
        let (db, _dir) = temp_db();
        let repo = TransferRepository::new(&db);
        repo.create(&new_transfer(1, 10)).unwrap();
        repo.create(&new_transfer(2, 10)).unwrap();
        repo.create(&new_transfer(1, 11)).unwrap();

        assert_eq!(repo.list_by_wallet(1).unwrap().len(), 2);
        assert_eq!(repo.list_by_sender(10).unwrap().len(), 2);
        assert_eq!(repo.list_by_sender(12).unwrap().len(), 0);

        repo.close(1, TransferStatus::Failed).unwrap();
        let unprocessed: Vec<u64> = repo.list_unprocessed().unwrap().iter().map(|t| t.id).collect();
        assert_eq!(unprocessed, vec![2, 3]);
    }

    #[test]
    fn claim_succeeds_once() {
        let (db, _dir) = temp_db();
        let repo = TransferRepository::new(&db);
        let transfer = repo.create(&new_transfer(1, 10)).unwrap();

        let claimed = repo.claim_for_settlement(transfer.id).unwrap().unwrap();
        assert!(claimed.is_processed);
        assert_eq!(claimed.status, TransferStatus::Pending);
        assert!(repo.claim_for_settlement(transfer.id).unwrap().is_none());
        assert!(!repo.close(transfer.id, TransferStatus::Failed).unwrap());
        assert!(repo.record_attempt(transfer.id).unwrap().is_none());
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let (db, _dir) = temp_db();
        let db = Arc::new(db);
        let id = TransferRepository::new(&db).create(&new_transfer(1, 10)).unwrap().id;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    TransferRepository::new(&db)
                        .claim_for_settlement(id)
                        .unwrap()
                        .is_some()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn attempts_accumulate_until_closed() {
        let (db, _dir) = temp_db();
        let repo = TransferRepository::new(&db);
        let transfer = repo.create(&new_transfer(1, 10)).unwrap();

        repo.record_attempt(transfer.id).unwrap();
        let after = repo.record_attempt(transfer.id).unwrap().unwrap();
        assert_eq!(after.check_attempts, 2);

        let linked = repo.link_transaction(transfer.id, "cd").unwrap().unwrap();
        assert_eq!(linked.linked_tx_id.as_deref(), Some("cd"));

        assert!(repo.close(transfer.id, TransferStatus::Failed).unwrap());
        assert!(repo.link_transaction(transfer.id, "ef").unwrap().is_none());
        let closed = repo.get(transfer.id).unwrap();
        assert!(closed.is_processed);
        assert_eq!(closed.status, TransferStatus::Failed);
    }
}
