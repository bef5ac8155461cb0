// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Transfer Settlement
//!
//! Moves a ledger balance from the sender's wallet to the receiver's wallet
//! once the linked on-chain transaction reaches the confirmation threshold.
//!
//! ## Strategy
//!
//! `create_transfer` checks its preconditions in order (amount, source
//! wallet ownership, receiver wallet, balance), stores a `pending`
//! transfer and returns. A background task then runs [`settle_once`]:
//!
//! 1. An already processed transfer is left alone.
//! 2. The linked transaction's depth is looked up.
//! 3. A lookup error closes the transfer as `failed`.
//! 4. At or above the threshold the processed latch is claimed first, then
//!    the source is debited (re-checking the balance) and the receiver
//!    credited. A failed credit refunds the sender once and ends `failed`.
//! 5. Below the threshold, [`ConfirmationPolicy`] decides: `FailFast`
//!    closes the transfer as `failed`; `Retry` counts an attempt and checks
//!    again later, failing once attempts run out.
//!
//! ## Shutdown
//!
//! Waiting retries stop when the shutdown token is cancelled. Unprocessed
//! transfers are picked up again by [`TransferSettlement::resume_pending`].
//!
//! [`settle_once`]: TransferSettlement::settle_once

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Txid;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blockchain::{ChainClient, ChainClientError, CONFIRMATION_THRESHOLD};
use crate::ledger::WalletLedger;
use crate::storage::{
    NewTransfer, OwnershipEnforcer, SettlementDb, Transfer, TransferRepository, TransferStatus,
};

use super::notify::{SettlementNotifier, Subject};
use super::{SettlementError, SettlementResult};

/// Default delay between confirmation checks under [`ConfirmationPolicy::Retry`].
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of checks before a retried transfer fails.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 60;

/// What to do when the linked transaction is not deep enough yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationPolicy {
    /// One check; anything below the threshold fails the transfer.
    FailFast,
    /// Check every `interval` until confirmed or `max_attempts` checks ran.
    Retry { interval: Duration, max_attempts: u32 },
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        ConfirmationPolicy::Retry {
            interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
        }
    }
}

/// Input of [`TransferSettlement::create_transfer`].
#[derive(Debug, Clone)]
pub struct CreateTransferRequest {
    pub source_wallet_id: u64,
    /// Minor units
    pub amount: i64,
    pub sender_id: u64,
    pub receiver_address: String,
    pub price_currency: String,
    pub pay_currency: String,
    pub comment: String,
    /// On-chain transaction backing the transfer, if already known
    pub linked_tx_id: Option<String>,
}

/// Result of one settlement attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Another attempt already processed the transfer
    AlreadyProcessed,
    /// Below the threshold; will be checked again
    Deferred { attempts: u32 },
    /// Reached a final status
    Settled(Transfer),
}

fn validate_tx_id(tx_id: &str) -> SettlementResult<()> {
    Txid::from_str(tx_id)
        .map(|_| ())
        .map_err(|e| SettlementError::Validation(format!("invalid transaction id {tx_id}: {e}")))
}

/// Exactly-once settlement of wallet-to-wallet transfers.
#[derive(Clone)]
pub struct TransferSettlement {
    db: Arc<SettlementDb>,
    ledger: WalletLedger,
    chain: Arc<dyn ChainClient>,
    notifier: SettlementNotifier,
    policy: ConfirmationPolicy,
    shutdown: CancellationToken,
}

impl TransferSettlement {
    pub fn new(
        db: Arc<SettlementDb>,
        ledger: WalletLedger,
        chain: Arc<dyn ChainClient>,
        notifier: SettlementNotifier,
        policy: ConfirmationPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            db,
            ledger,
            chain,
            notifier,
            policy,
            shutdown,
        }
    }

    fn transfers(&self) -> TransferRepository<'_> {
        TransferRepository::new(&self.db)
    }

    /// Validate and store a transfer, then schedule its settlement.
    ///
    /// Returns before any confirmation check has run.
    pub async fn create_transfer(&self, request: CreateTransferRequest) -> SettlementResult<Transfer> {
        if request.amount <= 0 {
            return Err(SettlementError::Validation(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }

        let source = self.ledger.get_wallet(request.source_wallet_id)?;
        source.verify_ownership(request.sender_id)?;

        let receiver = self.ledger.get_wallet_by_address(&request.receiver_address)?;

        // Checked again inside the debit at settlement time.
        if source.balance < request.amount {
            return Err(SettlementError::InsufficientFunds(format!(
                "wallet {} holds {}, transfer needs {}",
                source.id, source.balance, request.amount
            )));
        }

        if let Some(tx_id) = request.linked_tx_id.as_deref() {
            validate_tx_id(tx_id)?;
        }

        let transfer = self.transfers().create(&NewTransfer {
            source_wallet_id: source.id,
            receiver_wallet_id: receiver.id,
            amount: request.amount,
            price_currency: request.price_currency,
            pay_currency: request.pay_currency,
            comment: request.comment,
            sender_id: request.sender_id,
            receiver_address: request.receiver_address,
            linked_tx_id: request.linked_tx_id,
        })?;

        info!(
            transfer_id = transfer.id,
            source_wallet_id = transfer.source_wallet_id,
            receiver_wallet_id = transfer.receiver_wallet_id,
            amount = transfer.amount,
            "Transfer created"
        );
        self.schedule(transfer.id);
        Ok(transfer)
    }

    /// Link (or replace) the on-chain transaction of an unprocessed transfer
    /// and schedule a check.
    pub fn attach_transaction(
        &self,
        transfer_id: u64,
        sender_id: u64,
        tx_id: &str,
    ) -> SettlementResult<Transfer> {
        validate_tx_id(tx_id)?;
        let transfer = self.transfers().get(transfer_id)?;
        transfer.verify_ownership(sender_id)?;

        let transfer = self
            .transfers()
            .link_transaction(transfer_id, tx_id)?
            .ok_or_else(|| {
                SettlementError::Validation(format!("transfer {transfer_id} is already processed"))
            })?;
        info!(transfer_id, tx_id = %tx_id, "Transaction linked to transfer");
        self.schedule(transfer_id);
        Ok(transfer)
    }

    fn schedule(&self, transfer_id: u64) {
        let settlement = self.clone();
        tokio::spawn(async move { settlement.run(transfer_id).await });
    }

    async fn run(self, transfer_id: u64) {
        loop {
            match self.settle_once(transfer_id).await {
                Ok(SettleOutcome::Deferred { attempts }) => {
                    let ConfirmationPolicy::Retry { interval, .. } = self.policy else {
                        break;
                    };
                    debug!(transfer_id, attempts, "Transfer below threshold, will retry");
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {},
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                Ok(_) => break,
                Err(e) => {
                    warn!(transfer_id, error = %e, "Transfer settlement attempt failed");
                    break;
                }
            }
        }
    }

    /// Run one settlement attempt. Safe to call concurrently and repeatedly;
    /// funds move at most once.
    pub async fn settle_once(&self, transfer_id: u64) -> SettlementResult<SettleOutcome> {
        let transfer = self.transfers().get(transfer_id)?;
        if transfer.is_processed {
            return Ok(SettleOutcome::AlreadyProcessed);
        }

        let depth = match transfer.linked_tx_id.as_deref() {
            Some(tx_id) => self.chain.get_transaction_confirmations(tx_id).await,
            None => Err(ChainClientError::TransactionNotFound(format!(
                "no transaction linked to transfer {transfer_id}"
            ))),
        };

        match depth {
            Ok(confirmations) if confirmations >= CONFIRMATION_THRESHOLD => {
                self.move_funds(&transfer)
            }
            Ok(confirmations) => self.below_threshold(&transfer, confirmations),
            // Not broadcast yet: only retrying can still see it confirm.
            Err(ChainClientError::TransactionNotFound(_))
                if matches!(self.policy, ConfirmationPolicy::Retry { .. }) =>
            {
                self.below_threshold(&transfer, 0)
            }
            Err(e) => {
                warn!(transfer_id, error = %e, "Confirmation lookup failed, failing transfer");
                self.close_failed(transfer_id)
            }
        }
    }

    fn below_threshold(&self, transfer: &Transfer, confirmations: i64) -> SettlementResult<SettleOutcome> {
        match self.policy {
            ConfirmationPolicy::FailFast => {
                info!(
                    transfer_id = transfer.id,
                    confirmations,
                    "Transfer below confirmation threshold, failing"
                );
                self.close_failed(transfer.id)
            }
            ConfirmationPolicy::Retry { max_attempts, .. } => {
                let Some(updated) = self.transfers().record_attempt(transfer.id)? else {
                    return Ok(SettleOutcome::AlreadyProcessed);
                };
                if updated.check_attempts >= max_attempts {
                    info!(
                        transfer_id = transfer.id,
                        attempts = updated.check_attempts,
                        confirmations,
                        "Transfer never confirmed, failing"
                    );
                    return self.close_failed(transfer.id);
                }
                Ok(SettleOutcome::Deferred {
                    attempts: updated.check_attempts,
                })
            }
        }
    }

    /// Close an unprocessed transfer as failed without moving funds.
    fn close_failed(&self, transfer_id: u64) -> SettlementResult<SettleOutcome> {
        if !self.transfers().close(transfer_id, TransferStatus::Failed)? {
            return Ok(SettleOutcome::AlreadyProcessed);
        }
        let transfer = self.transfers().get(transfer_id)?;
        self.announce(&transfer);
        Ok(SettleOutcome::Settled(transfer))
    }

    fn move_funds(&self, transfer: &Transfer) -> SettlementResult<SettleOutcome> {
        let Some(claimed) = self.transfers().claim_for_settlement(transfer.id)? else {
            return Ok(SettleOutcome::AlreadyProcessed);
        };

        if let Err(e) = self.ledger.debit(claimed.source_wallet_id, claimed.amount) {
            warn!(transfer_id = claimed.id, error = %e, "Debit failed, no funds moved");
            return self.finish(claimed.id, TransferStatus::Failed);
        }

        if let Err(e) = self.ledger.credit(claimed.receiver_wallet_id, claimed.amount) {
            warn!(transfer_id = claimed.id, error = %e, "Credit failed, refunding sender");
            if let Err(refund) = self.ledger.credit(claimed.source_wallet_id, claimed.amount) {
                error!(
                    transfer_id = claimed.id,
                    source_wallet_id = claimed.source_wallet_id,
                    amount = claimed.amount,
                    error = %refund,
                    "Refund failed, manual resolution required"
                );
            }
            return self.finish(claimed.id, TransferStatus::Failed);
        }

        self.finish(claimed.id, TransferStatus::Completed)
    }

    fn finish(&self, transfer_id: u64, status: TransferStatus) -> SettlementResult<SettleOutcome> {
        let transfer = self.transfers().update_status(transfer_id, status)?;
        self.announce(&transfer);
        Ok(SettleOutcome::Settled(transfer))
    }

    fn announce(&self, transfer: &Transfer) {
        info!(
            transfer_id = transfer.id,
            status = %transfer.status,
            amount = transfer.amount,
            "Transfer settled"
        );
        self.notifier
            .publish(Subject::Transfer, transfer.id.to_string(), transfer.status);
    }

    pub fn get_transfer(&self, transfer_id: u64) -> SettlementResult<Transfer> {
        Ok(self.transfers().get(transfer_id)?)
    }

    pub fn list_wallet_transfers(&self, wallet_id: u64) -> SettlementResult<Vec<Transfer>> {
        Ok(self.transfers().list_by_wallet(wallet_id)?)
    }

    pub fn list_user_transfers(&self, sender_id: u64) -> SettlementResult<Vec<Transfer>> {
        Ok(self.transfers().list_by_sender(sender_id)?)
    }

    /// Schedule settlement for every unprocessed transfer.
    pub fn resume_pending(&self) -> SettlementResult<usize> {
        let pending = self.transfers().list_unprocessed()?;
        for transfer in &pending {
            self.schedule(transfer.id);
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "Resumed pending transfers");
        }
        Ok(pending.len())
    }
}
