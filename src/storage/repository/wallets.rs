// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Payout wallet repository.
//!
//! ## Storage Layout
//!
//! ```text
//! wallets           wallet_id          → PayoutWallet (JSON)
//! wallet_addresses  address            → wallet_id
//! default_wallets   user_id|CURRENCY   → wallet_id
//! ```
//!
//! The `is_default` flag on each record and the `default_wallets` index are
//! always written in the same transaction, so a (user, currency) pair can
//! never end up with two defaults, and a failed swap leaves the old one.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, Table};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::super::database::{
    default_key, next_id, DbError, DbResult, SettlementDb, DEFAULT_WALLETS, WALLETS,
    WALLET_ADDRESSES,
};

const WALLET_SEQUENCE: &str = "wallets";

/// A user's payout wallet and its internal ledger balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PayoutWallet {
    /// Wallet id
    pub id: u64,
    /// Owning user
    pub owner_user_id: u64,
    /// Currency code (uppercase, e.g. `BTC`)
    pub currency: String,
    /// On-chain address, unique across all wallets
    pub address: String,
    /// Balance in minor units; never negative
    pub balance: i64,
    /// Whether this is the user's default wallet for `currency`
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl super::super::OwnedResource for PayoutWallet {
    fn owner_user_id(&self) -> u64 {
        self.owner_user_id
    }

    fn resource_label(&self) -> String {
        format!("wallet {}", self.id)
    }
}

/// Fields for a wallet about to be created.
#[derive(Debug, Clone)]
pub struct NewWallet {
    pub owner_user_id: u64,
    pub currency: String,
    pub address: String,
    pub is_default: bool,
}

/// Changes applied by [`WalletRepository::update`].
#[derive(Debug, Clone, Default)]
pub struct WalletUpdate {
    pub currency: Option<String>,
    pub address: Option<String>,
    pub is_default: bool,
}

type WalletTable<'txn> = Table<'txn, u64, &'static [u8]>;
type IndexTable<'txn> = Table<'txn, &'static str, u64>;

fn load_wallet(
    table: &impl ReadableTable<u64, &'static [u8]>,
    wallet_id: u64,
) -> DbResult<Option<PayoutWallet>> {
    match table.get(wallet_id)? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

fn require_wallet(
    table: &impl ReadableTable<u64, &'static [u8]>,
    wallet_id: u64,
) -> DbResult<PayoutWallet> {
    load_wallet(table, wallet_id)?.ok_or_else(|| DbError::NotFound(format!("Wallet {wallet_id}")))
}

fn put_wallet(table: &mut WalletTable<'_>, wallet: &PayoutWallet) -> DbResult<()> {
    let json = serde_json::to_vec(wallet)?;
    table.insert(wallet.id, json.as_slice())?;
    Ok(())
}

/// Point the default index at `wallet_id`, clearing the flag on the previous
/// default. The caller sets the flag on the new default itself.
fn swap_default(
    wallets: &mut WalletTable<'_>,
    defaults: &mut IndexTable<'_>,
    key: &str,
    wallet_id: u64,
) -> DbResult<()> {
    let previous = defaults.get(key)?.map(|v| v.value());
    if let Some(previous_id) = previous.filter(|id| *id != wallet_id) {
        if let Some(mut previous_wallet) = load_wallet(&*wallets, previous_id)? {
            previous_wallet.is_default = false;
            previous_wallet.updated_at = Utc::now();
            put_wallet(wallets, &previous_wallet)?;
        }
    }
    defaults.insert(key, wallet_id)?;
    Ok(())
}

/// Remove the default index entry for `key` if it still points at `wallet_id`.
fn clear_default(defaults: &mut IndexTable<'_>, key: &str, wallet_id: u64) -> DbResult<()> {
    let current = defaults.get(key)?.map(|v| v.value());
    if current == Some(wallet_id) {
        defaults.remove(key)?;
    }
    Ok(())
}

/// Repository for payout wallets.
pub struct WalletRepository<'a> {
    db: &'a SettlementDb,
}

impl<'a> WalletRepository<'a> {
    pub fn new(db: &'a SettlementDb) -> Self {
        Self { db }
    }

    /// Create a wallet with a zero balance.
    ///
    /// # Returns
    /// - `Err(DbError::AlreadyExists)` if the address is already registered
    pub fn create(&self, new: &NewWallet) -> DbResult<PayoutWallet> {
        let write_txn = self.db.begin_write()?;
        let wallet = {
            let mut addresses = write_txn.open_table(WALLET_ADDRESSES)?;
            if addresses.get(new.address.as_str())?.is_some() {
                return Err(DbError::AlreadyExists(format!(
                    "Wallet address {}",
                    new.address
                )));
            }

            let id = next_id(&write_txn, WALLET_SEQUENCE)?;
            let now = Utc::now();
            let wallet = PayoutWallet {
                id,
                owner_user_id: new.owner_user_id,
                currency: new.currency.clone(),
                address: new.address.clone(),
                balance: 0,
                is_default: new.is_default,
                created_at: now,
                updated_at: now,
            };

            let mut wallets = write_txn.open_table(WALLETS)?;
            if wallet.is_default {
                let mut defaults = write_txn.open_table(DEFAULT_WALLETS)?;
                let key = default_key(wallet.owner_user_id, &wallet.currency);
                swap_default(&mut wallets, &mut defaults, &key, id)?;
            }
            put_wallet(&mut wallets, &wallet)?;
            addresses.insert(wallet.address.as_str(), id)?;
            wallet
        };
        write_txn.commit()?;
        Ok(wallet)
    }

    pub fn get(&self, wallet_id: u64) -> DbResult<PayoutWallet> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(WALLETS)?;
        require_wallet(&table, wallet_id)
    }

    pub fn find_by_address(&self, address: &str) -> DbResult<Option<PayoutWallet>> {
        let read_txn = self.db.begin_read()?;
        let addresses = read_txn.open_table(WALLET_ADDRESSES)?;
        let Some(wallet_id) = addresses.get(address)?.map(|v| v.value()) else {
            return Ok(None);
        };
        let wallets = read_txn.open_table(WALLETS)?;
        load_wallet(&wallets, wallet_id)
    }

    pub fn find_default(&self, owner_user_id: u64, currency: &str) -> DbResult<Option<PayoutWallet>> {
        let read_txn = self.db.begin_read()?;
        let defaults = read_txn.open_table(DEFAULT_WALLETS)?;
        let key = default_key(owner_user_id, currency);
        let Some(wallet_id) = defaults.get(key.as_str())?.map(|v| v.value()) else {
            return Ok(None);
        };
        let wallets = read_txn.open_table(WALLETS)?;
        load_wallet(&wallets, wallet_id)
    }

    /// List all wallets owned by a user, oldest first.
    pub fn list_by_owner(&self, owner_user_id: u64) -> DbResult<Vec<PayoutWallet>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(WALLETS)?;

        let mut wallets = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let wallet: PayoutWallet = serde_json::from_slice(value.value())?;
            if wallet.owner_user_id == owner_user_id {
                wallets.push(wallet);
            }
        }
        Ok(wallets)
    }

    /// Make `wallet_id` the owner's default for its currency.
    ///
    /// Unset-then-set happens in one write transaction.
    pub fn set_default(&self, owner_user_id: u64, wallet_id: u64) -> DbResult<PayoutWallet> {
        let write_txn = self.db.begin_write()?;
        let wallet = {
            let mut wallets = write_txn.open_table(WALLETS)?;
            let mut defaults = write_txn.open_table(DEFAULT_WALLETS)?;

            let mut wallet = require_wallet(&wallets, wallet_id)?;
            if wallet.owner_user_id != owner_user_id {
                return Err(DbError::NotFound(format!(
                    "Wallet {wallet_id} for user {owner_user_id}"
                )));
            }

            let key = default_key(owner_user_id, &wallet.currency);
            swap_default(&mut wallets, &mut defaults, &key, wallet_id)?;
            wallet.is_default = true;
            wallet.updated_at = Utc::now();
            put_wallet(&mut wallets, &wallet)?;
            wallet
        };
        write_txn.commit()?;
        Ok(wallet)
    }

    /// Update currency, address and default flag of a wallet.
    pub fn update(&self, wallet_id: u64, changes: &WalletUpdate) -> DbResult<PayoutWallet> {
        let write_txn = self.db.begin_write()?;
        let wallet = {
            let mut wallets = write_txn.open_table(WALLETS)?;
            let mut addresses = write_txn.open_table(WALLET_ADDRESSES)?;
            let mut defaults = write_txn.open_table(DEFAULT_WALLETS)?;

            let mut wallet = require_wallet(&wallets, wallet_id)?;

            if let Some(address) = changes.address.as_deref().filter(|a| *a != wallet.address) {
                if addresses.get(address)?.is_some() {
                    return Err(DbError::AlreadyExists(format!("Wallet address {address}")));
                }
                addresses.remove(wallet.address.as_str())?;
                addresses.insert(address, wallet_id)?;
                wallet.address = address.to_string();
            }

            // Leaving the old (user, currency) slot before any move.
            if wallet.is_default {
                let old_key = default_key(wallet.owner_user_id, &wallet.currency);
                clear_default(&mut defaults, &old_key, wallet_id)?;
            }
            if let Some(currency) = changes.currency.as_deref() {
                wallet.currency = currency.to_string();
            }

            if changes.is_default {
                let key = default_key(wallet.owner_user_id, &wallet.currency);
                swap_default(&mut wallets, &mut defaults, &key, wallet_id)?;
            }
            wallet.is_default = changes.is_default;
            wallet.updated_at = Utc::now();
            put_wallet(&mut wallets, &wallet)?;
            wallet
        };
        write_txn.commit()?;
        Ok(wallet)
    }

    /// Remove a wallet and its index entries.
    pub fn delete(&self, wallet_id: u64) -> DbResult<PayoutWallet> {
        let write_txn = self.db.begin_write()?;
        let wallet = {
            let mut wallets = write_txn.open_table(WALLETS)?;
            let mut addresses = write_txn.open_table(WALLET_ADDRESSES)?;
            let mut defaults = write_txn.open_table(DEFAULT_WALLETS)?;

            let wallet = require_wallet(&wallets, wallet_id)?;
            wallets.remove(wallet_id)?;
            addresses.remove(wallet.address.as_str())?;
            let key = default_key(wallet.owner_user_id, &wallet.currency);
            clear_default(&mut defaults, &key, wallet_id)?;
            wallet
        };
        write_txn.commit()?;
        Ok(wallet)
    }

    /// Read-modify-write of a wallet balance in a single write transaction.
    ///
    /// `compute` receives the current record and returns the new balance; if
    /// it fails, nothing is written. Concurrent callers are serialized, so
    /// no update is lost.
    pub fn update_balance<E>(
        &self,
        wallet_id: u64,
        compute: impl FnOnce(&PayoutWallet) -> Result<i64, E>,
    ) -> Result<PayoutWallet, E>
    where
        E: From<DbError>,
    {
        let write_txn = self.db.begin_write()?;
        let wallet = {
            let mut wallets = write_txn.open_table(WALLETS).map_err(DbError::from)?;
            let mut wallet = require_wallet(&wallets, wallet_id)?;
            wallet.balance = compute(&wallet)?;
            wallet.updated_at = Utc::now();
            put_wallet(&mut wallets, &wallet)?;
            wallet
        };
        write_txn.commit().map_err(DbError::from)?;
        Ok(wallet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn temp_db() -> (SettlementDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = SettlementDb::open(&dir.path().join("wallets.redb")).unwrap();
        (db, dir)
    }

    fn new_wallet(user: u64, address: &str, is_default: bool) -> NewWallet {
        NewWallet {
            owner_user_id: user,
            currency: "BTC".to_string(),
            address: address.to_string(),
            is_default,
        }
    }

    fn defaults_for(repo: &WalletRepository<'_>, user: u64) -> Vec<u64> {
        repo.list_by_owner(user)
            .unwrap()
            .into_iter()
            .filter(|w| w.is_default)
            .map(|w| w.id)
            .collect()
    }

    #[test]
    fn create_and_lookup() {
        let (db, _dir) = temp_db();
        let repo = WalletRepository::new(&db);

        let wallet = repo.create(&new_wallet(1, "addr-1", false)).unwrap();
        assert_eq!(wallet.balance, 0);
        assert_eq!(repo.get(wallet.id).unwrap(), wallet);
        assert_eq!(repo.find_by_address("addr-1").unwrap(), Some(wallet));
        assert!(repo.find_by_address("addr-2").unwrap().is_none());
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let (db, _dir) = temp_db();
        let repo = WalletRepository::new(&db);

        repo.create(&new_wallet(1, "addr-1", false)).unwrap();
        let result = repo.create(&new_wallet(2, "addr-1", false));
        assert!(matches!(result, Err(DbError::AlreadyExists(_))));
    }

    #[test]
    fn creating_a_default_unsets_the_previous_one() {
        let (db, _dir) = temp_db();
        let repo = WalletRepository::new(&db);

        let first = repo.create(&new_wallet(1, "addr-1", true)).unwrap();
        let second = repo.create(&new_wallet(1, "addr-2", true)).unwrap();

        assert_eq!(defaults_for(&repo, 1), vec![second.id]);
        assert!(!repo.get(first.id).unwrap().is_default);
        assert_eq!(repo.find_default(1, "btc").unwrap().unwrap().id, second.id);
    }

    #[test]
    fn set_default_swaps_atomically() {
        let (db, _dir) = temp_db();
        let repo = WalletRepository::new(&db);

        let first = repo.create(&new_wallet(1, "addr-1", true)).unwrap();
        let second = repo.create(&new_wallet(1, "addr-2", false)).unwrap();

        repo.set_default(1, second.id).unwrap();
        assert_eq!(defaults_for(&repo, 1), vec![second.id]);

        repo.set_default(1, first.id).unwrap();
        assert_eq!(defaults_for(&repo, 1), vec![first.id]);
    }

    #[test]
    fn set_default_for_foreign_wallet_changes_nothing() {
        let (db, _dir) = temp_db();
        let repo = WalletRepository::new(&db);

        let mine = repo.create(&new_wallet(1, "addr-1", true)).unwrap();
        let theirs = repo.create(&new_wallet(2, "addr-2", false)).unwrap();

        assert!(matches!(repo.set_default(1, theirs.id), Err(DbError::NotFound(_))));
        assert_eq!(defaults_for(&repo, 1), vec![mine.id]);
        assert!(defaults_for(&repo, 2).is_empty());
    }

    #[test]
    fn concurrent_set_default_keeps_one_default() {
        let (db, _dir) = temp_db();
        let db = Arc::new(db);
        let ids: Vec<u64> = (0..4)
            .map(|i| {
                WalletRepository::new(&db)
                    .create(&new_wallet(1, &format!("addr-{i}"), i == 0))
                    .unwrap()
                    .id
            })
            .collect();

        let handles: Vec<_> = ids
            .iter()
            .copied()
            .map(|id| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        WalletRepository::new(&db).set_default(1, id).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let repo = WalletRepository::new(&db);
        let defaults = defaults_for(&repo, 1);
        assert_eq!(defaults.len(), 1);
        assert_eq!(repo.find_default(1, "BTC").unwrap().unwrap().id, defaults[0]);
    }

    #[test]
    fn update_moves_address_index() {
        let (db, _dir) = temp_db();
        let repo = WalletRepository::new(&db);
        let wallet = repo.create(&new_wallet(1, "addr-1", false)).unwrap();

        let updated = repo
            .update(
                wallet.id,
                &WalletUpdate {
                    address: Some("addr-9".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.address, "addr-9");
        assert!(repo.find_by_address("addr-1").unwrap().is_none());
        assert_eq!(repo.find_by_address("addr-9").unwrap().unwrap().id, wallet.id);
    }

    #[test]
    fn update_currency_leaves_old_default_slot() {
        let (db, _dir) = temp_db();
        let repo = WalletRepository::new(&db);
        let wallet = repo.create(&new_wallet(1, "addr-1", true)).unwrap();

        repo.update(
            wallet.id,
            &WalletUpdate {
                currency: Some("LTC".to_string()),
                address: None,
                is_default: true,
            },
        )
        .unwrap();

        assert!(repo.find_default(1, "BTC").unwrap().is_none());
        assert_eq!(repo.find_default(1, "LTC").unwrap().unwrap().id, wallet.id);
    }

    #[test]
    fn delete_clears_indexes() {
        let (db, _dir) = temp_db();
        let repo = WalletRepository::new(&db);
        let wallet = repo.create(&new_wallet(1, "addr-1", true)).unwrap();

        repo.delete(wallet.id).unwrap();
        assert!(matches!(repo.get(wallet.id), Err(DbError::NotFound(_))));
        assert!(repo.find_by_address("addr-1").unwrap().is_none());
        assert!(repo.find_default(1, "BTC").unwrap().is_none());

        // Address is free again.
        repo.create(&new_wallet(2, "addr-1", false)).unwrap();
    }

    #[test]
    fn failed_balance_update_writes_nothing() {
        let (db, _dir) = temp_db();
        let repo = WalletRepository::new(&db);
        let wallet = repo.create(&new_wallet(1, "addr-1", false)).unwrap();

        let result: Result<PayoutWallet, DbError> =
            repo.update_balance(wallet.id, |_| Err(DbError::NotFound("rejected".to_string())));
        assert!(result.is_err());
        assert_eq!(repo.get(wallet.id).unwrap().balance, 0);
    }

    #[test]
    fn concurrent_balance_updates_are_not_lost() {
        let (db, _dir) = temp_db();
        let db = Arc::new(db);
        let wallet_id = WalletRepository::new(&db)
            .create(&new_wallet(1, "addr-1", false))
            .unwrap()
            .id;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        WalletRepository::new(&db)
                            .update_balance::<DbError>(wallet_id, |w| Ok(w.balance + 1))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(WalletRepository::new(&db).get(wallet_id).unwrap().balance, 200);
    }
}
