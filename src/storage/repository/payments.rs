// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Payment request repository.
//!
//! Payments are keyed by their 128-bit hex id. A row is only removed when
//! its watch could not be started, before the caller ever saw it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use redb::{ReadableTable, Table};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::blockchain::{ConfirmationStatus, CONFIRMATION_THRESHOLD};

use super::super::database::{DbError, DbResult, SettlementDb, PAYMENTS};

/// Settlement status of a payment.
///
/// Persisted as `waiting`, `pending`, `pending_confirmation (n/6)`,
/// `confirmed`, `completed` or `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PaymentStatus {
    /// Created, nothing seen on chain yet
    Waiting,
    /// Transaction seen in the mempool
    Pending,
    /// Mined with the given confirmation count (below the threshold)
    PendingConfirmation(i64),
    /// Reached the confirmation threshold
    Confirmed,
    /// Settled by the payment provider
    Completed,
    /// Rejected by the payment provider
    Failed,
}

impl PaymentStatus {
    /// Map a classified confirmation event onto a payment status.
    pub fn from_confirmation(status: ConfirmationStatus, confirmations: i64) -> Self {
        match status {
            ConfirmationStatus::Pending => Self::Pending,
            ConfirmationStatus::PendingConfirmation => Self::PendingConfirmation(confirmations),
            ConfirmationStatus::Confirmed => Self::Confirmed,
        }
    }

    /// `completed` and `failed` are never left once reached.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Order of the chain-driven progression. Terminal states rank highest.
    pub fn rank(self) -> (u8, i64) {
        match self {
            Self::Waiting => (0, 0),
            Self::Pending => (1, 0),
            Self::PendingConfirmation(n) => (2, n),
            Self::Confirmed => (3, 0),
            Self::Completed | Self::Failed => (4, 0),
        }
    }

    /// Whether a live confirmation lookup is meaningful for this status.
    pub fn is_confirming(self) -> bool {
        matches!(self, Self::PendingConfirmation(_) | Self::Confirmed)
    }

    /// Nothing the tracker can report would advance the payment further.
    pub fn ends_watch(self) -> bool {
        self.rank().0 >= 3
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => f.write_str("waiting"),
            Self::Pending => f.write_str("pending"),
            Self::PendingConfirmation(n) => {
                write!(f, "pending_confirmation ({n}/{CONFIRMATION_THRESHOLD})")
            }
            Self::Confirmed => f.write_str("confirmed"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown payment status: {0}")]
pub struct UnknownPaymentStatus(pub String);

impl FromStr for PaymentStatus {
    type Err = UnknownPaymentStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            "waiting" => return Ok(Self::Waiting),
            "pending" => return Ok(Self::Pending),
            // Bare form carries no count; treat as the first confirmation.
            "pending_confirmation" => return Ok(Self::PendingConfirmation(1)),
            "confirmed" => return Ok(Self::Confirmed),
            "completed" => return Ok(Self::Completed),
            "failed" => return Ok(Self::Failed),
            _ => {}
        }

        trimmed
            .strip_prefix("pending_confirmation (")
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(|inner| inner.split_once('/'))
            .and_then(|(count, _)| count.trim().parse::<i64>().ok())
            .filter(|count| (1..CONFIRMATION_THRESHOLD).contains(count))
            .map(Self::PendingConfirmation)
            .ok_or_else(|| UnknownPaymentStatus(s.to_string()))
    }
}

impl From<PaymentStatus> for String {
    fn from(status: PaymentStatus) -> Self {
        status.to_string()
    }
}

impl TryFrom<String> for PaymentStatus {
    type Error = UnknownPaymentStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A payment request waiting for an on-chain transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Payment {
    /// 128-bit random id, lowercase hex
    pub payment_id: String,
    pub owner_user_id: u64,
    /// Amount in minor units
    pub amount: i64,
    pub currency: String,
    #[schema(value_type = String, example = "pending_confirmation (2/6)")]
    pub status: PaymentStatus,
    pub payment_url: String,
    /// Fresh address the payer sends to
    pub receiving_address: String,
    /// Merchant wallet address the payment is for
    pub merchant_wallet: String,
    /// Transaction last reported for the receiving address
    pub linked_tx_id: Option<String>,
    pub confirmations: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn load_payment(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    payment_id: &str,
) -> DbResult<Option<Payment>> {
    match table.get(payment_id)? {
        Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        None => Ok(None),
    }
}

fn put_payment(table: &mut Table<'_, &'static str, &'static [u8]>, payment: &Payment) -> DbResult<()> {
    let json = serde_json::to_vec(payment)?;
    table.insert(payment.payment_id.as_str(), json.as_slice())?;
    Ok(())
}

/// Repository for payment requests.
pub struct PaymentRepository<'a> {
    db: &'a SettlementDb,
}

impl<'a> PaymentRepository<'a> {
    pub fn new(db: &'a SettlementDb) -> Self {
        Self { db }
    }

    /// Persist a new payment.
    ///
    /// # Returns
    /// - `Err(DbError::AlreadyExists)` on an id collision
    pub fn create(&self, payment: &Payment) -> DbResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PAYMENTS)?;
            if table.get(payment.payment_id.as_str())?.is_some() {
                return Err(DbError::AlreadyExists(format!(
                    "Payment {}",
                    payment.payment_id
                )));
            }
            put_payment(&mut table, payment)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, payment_id: &str) -> DbResult<Payment> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PAYMENTS)?;
        load_payment(&table, payment_id)?
            .ok_or_else(|| DbError::NotFound(format!("Payment {payment_id}")))
    }

    /// Read-modify-write a payment in one write transaction.
    ///
    /// `apply` mutates the record and returns whether it should be stored.
    /// Returns the resulting record and that flag.
    pub fn update_with<E>(
        &self,
        payment_id: &str,
        apply: impl FnOnce(&mut Payment) -> Result<bool, E>,
    ) -> Result<(Payment, bool), E>
    where
        E: From<DbError>,
    {
        let write_txn = self.db.begin_write()?;
        let (payment, changed) = {
            let mut table = write_txn.open_table(PAYMENTS).map_err(DbError::from)?;
            let mut payment = load_payment(&table, payment_id)?
                .ok_or_else(|| DbError::NotFound(format!("Payment {payment_id}")))?;
            let changed = apply(&mut payment)?;
            if changed {
                payment.updated_at = Utc::now();
                put_payment(&mut table, &payment)?;
            }
            (payment, changed)
        };
        if changed {
            write_txn.commit().map_err(DbError::from)?;
        } else {
            write_txn.abort().map_err(DbError::from)?;
        }
        Ok((payment, changed))
    }

    /// Remove a payment. Returns false if it did not exist.
    pub fn delete(&self, payment_id: &str) -> DbResult<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(PAYMENTS)?;
            let removed = table.remove(payment_id)?.is_some();
            removed
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Payments whose status is not terminal.
    pub fn list_unfinished(&self) -> DbResult<Vec<Payment>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PAYMENTS)?;

        let mut payments = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let payment: Payment = serde_json::from_slice(value.value())?;
            if !payment.status.is_terminal() {
                payments.push(payment);
            }
        }
        Ok(payments)
    }
}
