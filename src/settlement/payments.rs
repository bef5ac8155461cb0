// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Payment requests settled by an incoming Bitcoin transaction.

use std::sync::Arc;

use bitcoin::Network;
use chrono::Utc;
use rand::RngCore;
use serde::Serialize;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::blockchain::{ChainClient, ConfirmationEvent};
use crate::storage::{Payment, PaymentRepository, PaymentStatus, SettlementDb};
use crate::tracker::{ConfirmationTracker, TrackerError};

use super::status::{StatusPipeline, StatusUpdate, UpdateOutcome, UpdateSource};
use super::{SettlementError, SettlementResult};

/// Current status of a payment as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct PaymentStatusView {
    pub payment_id: String,
    /// Persisted status string, e.g. `pending_confirmation (2/6)`
    #[schema(example = "pending_confirmation (2/6)")]
    pub status: String,
    /// Live depth of the linked transaction when available
    pub confirmations: i64,
}

/// Random 128-bit payment id, lowercase hex.
fn new_payment_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Creates payment requests and keeps their status in step with the chain.
#[derive(Clone)]
pub struct PaymentSettlement {
    db: Arc<SettlementDb>,
    chain: Arc<dyn ChainClient>,
    tracker: Arc<ConfirmationTracker>,
    pipeline: StatusPipeline,
    network: Network,
    base_url: String,
}

impl PaymentSettlement {
    pub fn new(
        db: Arc<SettlementDb>,
        chain: Arc<dyn ChainClient>,
        tracker: Arc<ConfirmationTracker>,
        pipeline: StatusPipeline,
        network: Network,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            chain,
            tracker,
            pipeline,
            network,
            base_url: base_url.into(),
        }
    }

    fn payments(&self) -> PaymentRepository<'_> {
        PaymentRepository::new(&self.db)
    }

    /// Create a payment request with a fresh receiving address and start
    /// watching that address.
    pub async fn create_payment(
        &self,
        user_id: u64,
        amount: i64,
        merchant_wallet: &str,
        currency: &str,
    ) -> SettlementResult<Payment> {
        if amount <= 0 {
            return Err(SettlementError::Validation(format!(
                "amount must be positive, got {amount}"
            )));
        }
        let currency = currency.trim();
        if currency.is_empty() {
            return Err(SettlementError::Validation("currency is required".to_string()));
        }
        let merchant_wallet = merchant_wallet.trim();
        if merchant_wallet.is_empty() {
            return Err(SettlementError::Validation(
                "merchant wallet is required".to_string(),
            ));
        }

        let payment_id = new_payment_id();
        let receiving_address = self.chain.generate_address().await?;
        let now = Utc::now();
        let payment = Payment {
            payment_url: format!("{}/pay/{payment_id}", self.base_url.trim_end_matches('/')),
            payment_id,
            owner_user_id: user_id,
            amount,
            currency: currency.to_ascii_uppercase(),
            status: PaymentStatus::Waiting,
            receiving_address,
            merchant_wallet: merchant_wallet.to_string(),
            linked_tx_id: None,
            confirmations: 0,
            created_at: now,
            updated_at: now,
        };

        // Stored before the watch starts so the first event finds the row.
        self.payments().create(&payment)?;
        if let Err(e) = self.start_watch(&payment) {
            warn!(
                payment_id = %payment.payment_id,
                error = %e,
                "Watch not started, discarding payment"
            );
            if let Err(db_err) = self.payments().delete(&payment.payment_id) {
                error!(
                    payment_id = %payment.payment_id,
                    error = %db_err,
                    "Failed to discard unwatched payment"
                );
            }
            return Err(e.into());
        }

        info!(
            payment_id = %payment.payment_id,
            user_id,
            amount,
            currency = %payment.currency,
            address = %payment.receiving_address,
            "Payment created"
        );
        Ok(payment)
    }

    fn start_watch(&self, payment: &Payment) -> Result<(), TrackerError> {
        let pipeline = self.pipeline.clone();
        let payment_id = payment.payment_id.clone();
        self.tracker.watch(
            &payment.receiving_address,
            self.network,
            move |event: ConfirmationEvent| {
                let update = StatusUpdate {
                    payment_id: payment_id.clone(),
                    status: PaymentStatus::from_confirmation(event.status, event.confirmations),
                    source: UpdateSource::Tracker,
                    tx_id: Some(event.tx_id),
                    confirmations: Some(event.confirmations),
                };
                if let Err(e) = pipeline.submit(update) {
                    warn!(payment_id = %payment_id, error = %e, "Dropped confirmation event");
                }
            },
        )?;
        Ok(())
    }

    /// Merge a status into the payment through the status pipeline.
    pub async fn update_payment_status(&self, update: StatusUpdate) -> SettlementResult<UpdateOutcome> {
        self.pipeline.submit_and_wait(update).await
    }

    pub fn get_payment(&self, payment_id: &str) -> SettlementResult<Payment> {
        Ok(self.payments().get(payment_id)?)
    }

    /// Stored status plus, while confirming, a live depth lookup of the
    /// linked transaction. A failed lookup falls back to the stored count.
    pub async fn get_payment_status(&self, payment_id: &str) -> SettlementResult<PaymentStatusView> {
        let payment = self.payments().get(payment_id)?;

        let mut confirmations = payment.confirmations;
        if payment.status.is_confirming() {
            if let Some(tx_id) = payment.linked_tx_id.as_deref() {
                match self.tracker.get_transaction_confirmations(tx_id).await {
                    Ok(live) => confirmations = live,
                    Err(e) => warn!(
                        payment_id = %payment_id,
                        tx_id = %tx_id,
                        error = %e,
                        "Live confirmation lookup failed, using stored count"
                    ),
                }
            }
        }

        Ok(PaymentStatusView {
            payment_id: payment.payment_id,
            status: payment.status.to_string(),
            confirmations,
        })
    }

    /// Re-register watches for payments the tracker can still advance.
    ///
    /// Returns the number of watches started.
    pub fn resume_watches(&self) -> SettlementResult<usize> {
        let mut resumed = 0;
        for payment in self.payments().list_unfinished()? {
            if payment.status.ends_watch() {
                continue;
            }
            match self.start_watch(&payment) {
                Ok(()) => resumed += 1,
                Err(TrackerError::AlreadyWatched(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if resumed > 0 {
            info!(resumed, "Resumed payment watches");
        }
        Ok(resumed)
    }
}
