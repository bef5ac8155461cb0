// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Wallet Ledger
//!
//! Internal balances of payout wallets and the per-user default wallet.
//!
//! ## Guarantees
//!
//! - A balance never goes negative: a debit checks and subtracts inside one
//!   write transaction, so concurrent debits cannot both pass the check.
//! - At most one default wallet exists per (user, currency); the swap is a
//!   single transaction.
//! - Every mutation is committed before the call returns, so the caller
//!   reads its own writes.

use std::sync::Arc;

use tracing::{debug, info};

use crate::blockchain::{ChainClient, ChainClientError};
use crate::storage::{
    DbError, NewWallet, PayoutWallet, SettlementDb, WalletRepository, WalletUpdate,
};

/// Currency whose wallets can get an address from the node.
pub const BTC: &str = "BTC";

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("insufficient funds in wallet {wallet_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        wallet_id: u64,
        balance: i64,
        requested: i64,
    },

    #[error("balance overflow in wallet {0}")]
    Overflow(u64),

    #[error("{0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("address already in use: {0}")]
    AddressTaken(String),

    #[error("chain client error: {0}")]
    Chain(#[from] ChainClientError),

    #[error("storage error: {0}")]
    Storage(DbError),
}

impl From<DbError> for LedgerError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => LedgerError::NotFound(what),
            DbError::AlreadyExists(what) => LedgerError::AddressTaken(what),
            other => LedgerError::Storage(other),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Changes accepted by [`WalletLedger::update_wallet`].
#[derive(Debug, Clone, Default)]
pub struct WalletChanges {
    pub currency: Option<String>,
    pub address: Option<String>,
    pub is_default: bool,
}

fn normalize_currency(currency: &str) -> LedgerResult<String> {
    let currency = currency.trim();
    if currency.is_empty() {
        return Err(LedgerError::Validation("currency is required".to_string()));
    }
    Ok(currency.to_ascii_uppercase())
}

fn require_positive(amount: i64) -> LedgerResult<()> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

// =============================================================================
// WalletLedger
// =============================================================================

/// Balance and wallet bookkeeping over the settlement database.
#[derive(Clone)]
pub struct WalletLedger {
    db: Arc<SettlementDb>,
    chain: Arc<dyn ChainClient>,
}

impl WalletLedger {
    pub fn new(db: Arc<SettlementDb>, chain: Arc<dyn ChainClient>) -> Self {
        Self { db, chain }
    }

    fn wallets(&self) -> WalletRepository<'_> {
        WalletRepository::new(&self.db)
    }

    /// Add `amount` to a wallet and return the new balance.
    pub fn credit(&self, wallet_id: u64, amount: i64) -> LedgerResult<i64> {
        require_positive(amount)?;
        let wallet = self.wallets().update_balance(wallet_id, |w| {
            w.balance
                .checked_add(amount)
                .ok_or(LedgerError::Overflow(wallet_id))
        })?;
        debug!(wallet_id, amount, balance = wallet.balance, "Wallet credited");
        Ok(wallet.balance)
    }

    /// Subtract `amount` from a wallet and return the new balance.
    ///
    /// Fails with [`LedgerError::InsufficientFunds`] and leaves the balance
    /// untouched if it would go negative.
    pub fn debit(&self, wallet_id: u64, amount: i64) -> LedgerResult<i64> {
        require_positive(amount)?;
        let wallet = self.wallets().update_balance(wallet_id, |w| {
            if w.balance < amount {
                return Err(LedgerError::InsufficientFunds {
                    wallet_id,
                    balance: w.balance,
                    requested: amount,
                });
            }
            Ok(w.balance - amount)
        })?;
        debug!(wallet_id, amount, balance = wallet.balance, "Wallet debited");
        Ok(wallet.balance)
    }

    /// Make `wallet_id` the user's default wallet for `currency`.
    pub fn set_default(
        &self,
        user_id: u64,
        wallet_id: u64,
        currency: &str,
    ) -> LedgerResult<PayoutWallet> {
        let currency = normalize_currency(currency)?;
        let wallet = self.wallets().get(wallet_id)?;
        if wallet.owner_user_id != user_id {
            return Err(LedgerError::NotFound(format!(
                "Wallet {wallet_id} for user {user_id}"
            )));
        }
        if !wallet.currency.eq_ignore_ascii_case(&currency) {
            return Err(LedgerError::Validation(format!(
                "wallet {wallet_id} holds {}, not {currency}",
                wallet.currency
            )));
        }

        let wallet = self.wallets().set_default(user_id, wallet_id)?;
        info!(user_id, wallet_id, currency = %currency, "Default wallet changed");
        Ok(wallet)
    }

    /// Create a wallet with a zero balance.
    ///
    /// BTC wallets without an address get a fresh one from the node; other
    /// currencies must supply one.
    pub async fn create_wallet(
        &self,
        user_id: u64,
        currency: &str,
        address: Option<String>,
        is_default: bool,
    ) -> LedgerResult<PayoutWallet> {
        let currency = normalize_currency(currency)?;
        let address = match address.map(|a| a.trim().to_string()).filter(|a| !a.is_empty()) {
            Some(address) => address,
            None if currency == BTC => self.chain.generate_address().await?,
            None => {
                return Err(LedgerError::Validation(format!(
                    "an address is required for {currency} wallets"
                )))
            }
        };

        let wallet = self.wallets().create(&NewWallet {
            owner_user_id: user_id,
            currency,
            address,
            is_default,
        })?;
        info!(
            user_id,
            wallet_id = wallet.id,
            currency = %wallet.currency,
            is_default,
            "Wallet created"
        );
        Ok(wallet)
    }

    /// Default BTC wallet provisioned at signup.
    pub async fn create_default_btc_wallet(&self, user_id: u64) -> LedgerResult<PayoutWallet> {
        self.create_wallet(user_id, BTC, None, true).await
    }

    pub fn get_wallet(&self, wallet_id: u64) -> LedgerResult<PayoutWallet> {
        Ok(self.wallets().get(wallet_id)?)
    }

    pub fn get_wallet_by_address(&self, address: &str) -> LedgerResult<PayoutWallet> {
        self.wallets()
            .find_by_address(address)?
            .ok_or_else(|| LedgerError::NotFound(format!("Wallet with address {address}")))
    }

    pub fn list_user_wallets(&self, user_id: u64) -> LedgerResult<Vec<PayoutWallet>> {
        Ok(self.wallets().list_by_owner(user_id)?)
    }

    pub fn get_default_wallet(&self, user_id: u64, currency: &str) -> LedgerResult<PayoutWallet> {
        let currency = normalize_currency(currency)?;
        self.wallets()
            .find_default(user_id, &currency)?
            .ok_or_else(|| LedgerError::NotFound(format!("Default {currency} wallet for user {user_id}")))
    }

    pub fn update_wallet(&self, wallet_id: u64, changes: WalletChanges) -> LedgerResult<PayoutWallet> {
        let currency = changes
            .currency
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .map(normalize_currency)
            .transpose()?;
        let address = changes
            .address
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());

        let wallet = self.wallets().update(
            wallet_id,
            &WalletUpdate {
                currency,
                address,
                is_default: changes.is_default,
            },
        )?;
        info!(wallet_id, is_default = wallet.is_default, "Wallet updated");
        Ok(wallet)
    }

    /// Delete a wallet. The default wallet cannot be deleted.
    pub fn delete_wallet(&self, wallet_id: u64) -> LedgerResult<()> {
        let wallet = self.wallets().get(wallet_id)?;
        if wallet.is_default {
            return Err(LedgerError::Validation(
                "cannot delete the default wallet".to_string(),
            ));
        }
        self.wallets().delete(wallet_id)?;
        info!(wallet_id, user_id = wallet.owner_user_id, "Wallet deleted");
        Ok(())
    }

    /// Administrative balance override.
    pub fn set_balance(&self, wallet_id: u64, balance: i64) -> LedgerResult<PayoutWallet> {
        if balance < 0 {
            return Err(LedgerError::Validation(format!(
                "balance cannot be negative, got {balance}"
            )));
        }
        let wallet = self
            .wallets()
            .update_balance::<LedgerError>(wallet_id, |_| Ok(balance))?;
        info!(wallet_id, balance, "Wallet balance set");
        Ok(wallet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::mock::MockChainClient;

    fn ledger() -> (WalletLedger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = SettlementDb::open(&dir.path().join("ledger.redb")).unwrap();
        (
            WalletLedger::new(Arc::new(db), Arc::new(MockChainClient::new())),
            dir,
        )
    }

    async fn funded(ledger: &WalletLedger, user: u64, balance: i64) -> PayoutWallet {
        let wallet = ledger.create_wallet(user, "btc", None, false).await.unwrap();
        ledger.set_balance(wallet.id, balance).unwrap()
    }

    #[tokio::test]
    async fn credit_and_debit_return_new_balance() {
        let (ledger, _dir) = ledger();
        let wallet = funded(&ledger, 1, 100).await;

        assert_eq!(ledger.credit(wallet.id, 25).unwrap(), 125);
        assert_eq!(ledger.debit(wallet.id, 125).unwrap(), 0);
        assert_eq!(ledger.get_wallet(wallet.id).unwrap().balance, 0);
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let (ledger, _dir) = ledger();
        let wallet = funded(&ledger, 1, 100).await;

        assert!(matches!(ledger.credit(wallet.id, 0), Err(LedgerError::InvalidAmount(0))));
        assert!(matches!(ledger.debit(wallet.id, -5), Err(LedgerError::InvalidAmount(-5))));
        assert_eq!(ledger.get_wallet(wallet.id).unwrap().balance, 100);
    }

    #[tokio::test]
    async fn overdraft_fails_closed() {
        let (ledger, _dir) = ledger();
        let wallet = funded(&ledger, 1, 30).await;

        let err = ledger.debit(wallet.id, 31).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds { balance: 30, requested: 31, .. }
        ));
        assert_eq!(ledger.get_wallet(wallet.id).unwrap().balance, 30);
    }

    #[tokio::test]
    async fn concurrent_debits_never_overdraw() {
        let (ledger, _dir) = ledger();
        let wallet = funded(&ledger, 1, 100).await;

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.debit(wallet.id, 15).is_ok())
            })
            .collect();
        let succeeded = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(succeeded, 6);
        assert_eq!(ledger.get_wallet(wallet.id).unwrap().balance, 10);
    }

    #[tokio::test]
    async fn missing_wallet_is_not_found() {
        let (ledger, _dir) = ledger();
        assert!(matches!(ledger.credit(42, 1), Err(LedgerError::NotFound(_))));
        assert!(matches!(ledger.get_wallet_by_address("nope"), Err(LedgerError::NotFound(_))));
    }

    #[tokio::test]
    async fn btc_wallet_gets_node_address_and_others_need_one() {
        let (ledger, _dir) = ledger();

        let btc = ledger.create_default_btc_wallet(1).await.unwrap();
        assert_eq!(btc.currency, "BTC");
        assert!(btc.is_default);
        assert!(!btc.address.is_empty());

        let err = ledger.create_wallet(1, "eur", None, false).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let err = ledger.create_wallet(1, "  ", Some("x".into()), false).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let eur = ledger
            .create_wallet(1, "eur", Some("iban-1".to_string()), false)
            .await
            .unwrap();
        assert_eq!(eur.currency, "EUR");
    }

    #[tokio::test]
    async fn duplicate_address_is_rejected() {
        let (ledger, _dir) = ledger();
        ledger.create_wallet(1, "EUR", Some("iban-1".into()), false).await.unwrap();
        let err = ledger
            .create_wallet(2, "EUR", Some("iban-1".into()), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AddressTaken(_)));
    }

    #[tokio::test]
    async fn set_default_keeps_exactly_one() {
        let (ledger, _dir) = ledger();
        let first = ledger.create_default_btc_wallet(1).await.unwrap();
        let second = ledger.create_wallet(1, "BTC", None, false).await.unwrap();

        ledger.set_default(1, second.id, "btc").unwrap();

        let defaults: Vec<u64> = ledger
            .list_user_wallets(1)
            .unwrap()
            .into_iter()
            .filter(|w| w.is_default)
            .map(|w| w.id)
            .collect();
        assert_eq!(defaults, vec![second.id]);
        assert!(!ledger.get_wallet(first.id).unwrap().is_default);
        assert_eq!(ledger.get_default_wallet(1, "BTC").unwrap().id, second.id);
    }

    #[tokio::test]
    async fn set_default_rejects_wrong_currency_or_owner() {
        let (ledger, _dir) = ledger();
        let btc = ledger.create_default_btc_wallet(1).await.unwrap();
        let eur = ledger.create_wallet(1, "EUR", Some("iban".into()), false).await.unwrap();

        assert!(matches!(
            ledger.set_default(1, eur.id, "BTC"),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(ledger.set_default(2, btc.id, "BTC"), Err(LedgerError::NotFound(_))));
        assert_eq!(ledger.get_default_wallet(1, "BTC").unwrap().id, btc.id);
    }

    #[tokio::test]
    async fn default_wallet_cannot_be_deleted() {
        let (ledger, _dir) = ledger();
        let default = ledger.create_default_btc_wallet(1).await.unwrap();
        let spare = ledger.create_wallet(1, "BTC", None, false).await.unwrap();

        assert!(matches!(ledger.delete_wallet(default.id), Err(LedgerError::Validation(_))));
        ledger.delete_wallet(spare.id).unwrap();
        assert!(matches!(ledger.get_wallet(spare.id), Err(LedgerError::NotFound(_))));
    }

    #[tokio::test]
    async fn update_wallet_can_take_over_default() {
        let (ledger, _dir) = ledger();
        let default = ledger.create_default_btc_wallet(1).await.unwrap();
        let spare = ledger.create_wallet(1, "BTC", None, false).await.unwrap();

        let updated = ledger
            .update_wallet(
                spare.id,
                WalletChanges {
                    address: Some("bc1-new".into()),
                    is_default: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(updated.is_default);
        assert_eq!(updated.address, "bc1-new");
        assert!(!ledger.get_wallet(default.id).unwrap().is_default);
        assert_eq!(ledger.get_wallet_by_address("bc1-new").unwrap().id, spare.id);
    }

    #[tokio::test]
    async fn negative_balance_override_is_rejected() {
        let (ledger, _dir) = ledger();
        let wallet = funded(&ledger, 1, 5).await;
        assert!(matches!(ledger.set_balance(wallet.id, -1), Err(LedgerError::Validation(_))));
        assert_eq!(ledger.get_wallet(wallet.id).unwrap().balance, 5);
    }
}
