// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Serialized payment status updates.
//!
//! ## Strategy
//!
//! Tracker callbacks and webhooks never write a payment directly. They
//! submit a [`StatusUpdate`] into one channel drained by a single consumer
//! task, which merges it against the stored record:
//!
//! - `completed` and `failed` are terminal and never overwritten
//! - otherwise an update applies when its rank is at least the current one:
//!   `waiting < pending < pending_confirmation (n/6) < confirmed`, with
//!   `pending_confirmation` ordered by `n`
//! - a terminal update applies over any non-terminal status
//!
//! Everything else is reported back as [`UpdateOutcome::Stale`].
//!
//! ## Shutdown
//!
//! The consumer exits when its `CancellationToken` is cancelled or every
//! sender is dropped. Submissions after that fail with
//! [`SettlementError::ShuttingDown`].

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::{Payment, PaymentRepository, PaymentStatus, SettlementDb};
use crate::tracker::ConfirmationTracker;

use super::notify::{SettlementNotifier, Subject};
use super::{SettlementError, SettlementResult};

/// Producer of a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Tracker,
    Webhook,
}

impl UpdateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateSource::Tracker => "tracker",
            UpdateSource::Webhook => "webhook",
        }
    }
}

/// A proposed status for one payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub payment_id: String,
    pub status: PaymentStatus,
    pub source: UpdateSource,
    /// Transaction that produced the update, if known
    pub tx_id: Option<String>,
    pub confirmations: Option<i64>,
}

impl StatusUpdate {
    pub fn from_webhook(payment_id: impl Into<String>, status: PaymentStatus) -> Self {
        Self {
            payment_id: payment_id.into(),
            status,
            source: UpdateSource::Webhook,
            tx_id: None,
            confirmations: None,
        }
    }
}

/// Result of merging an update into the stored payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Stored and announced
    Applied(Payment),
    /// Accepted but identical to what was stored
    Unchanged(Payment),
    /// Rejected by the merge rule; the stored record is returned
    Stale(Payment),
}

impl UpdateOutcome {
    pub fn payment(&self) -> &Payment {
        match self {
            UpdateOutcome::Applied(p) | UpdateOutcome::Unchanged(p) | UpdateOutcome::Stale(p) => p,
        }
    }
}

/// Whether `incoming` may replace `current`.
pub fn accepts(current: PaymentStatus, incoming: PaymentStatus) -> bool {
    if current.is_terminal() {
        return false;
    }
    incoming.is_terminal() || incoming.rank() >= current.rank()
}

type Reply = oneshot::Sender<SettlementResult<UpdateOutcome>>;

struct Submission {
    update: StatusUpdate,
    reply: Option<Reply>,
}

/// Handle for submitting updates to the single status writer.
#[derive(Clone)]
pub struct StatusPipeline {
    sender: mpsc::UnboundedSender<Submission>,
}

impl StatusPipeline {
    /// Spawn the consumer task and return the submission handle.
    pub fn spawn(
        db: Arc<SettlementDb>,
        tracker: Arc<ConfirmationTracker>,
        notifier: SettlementNotifier,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let consumer = StatusConsumer {
            db,
            tracker,
            notifier,
            receiver,
        };
        let handle = tokio::spawn(consumer.run(shutdown));
        (Self { sender }, handle)
    }

    /// Queue an update without waiting for the result.
    ///
    /// Safe to call from synchronous callbacks.
    pub fn submit(&self, update: StatusUpdate) -> SettlementResult<()> {
        self.sender
            .send(Submission {
                update,
                reply: None,
            })
            .map_err(|_| SettlementError::ShuttingDown)
    }

    /// Queue an update and wait for the merge outcome.
    pub async fn submit_and_wait(&self, update: StatusUpdate) -> SettlementResult<UpdateOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.sender
            .send(Submission {
                update,
                reply: Some(reply),
            })
            .map_err(|_| SettlementError::ShuttingDown)?;
        outcome.await.map_err(|_| SettlementError::ShuttingDown)?
    }
}

struct StatusConsumer {
    db: Arc<SettlementDb>,
    tracker: Arc<ConfirmationTracker>,
    notifier: SettlementNotifier,
    receiver: mpsc::UnboundedReceiver<Submission>,
}

impl StatusConsumer {
    async fn run(mut self, shutdown: CancellationToken) {
        info!("Status pipeline started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Status pipeline shutting down");
                    break;
                }
                submission = self.receiver.recv() => {
                    let Some(Submission { update, reply }) = submission else {
                        break;
                    };
                    let result = self.apply(&update);
                    if let Err(e) = &result {
                        warn!(
                            payment_id = %update.payment_id,
                            source = update.source.as_str(),
                            error = %e,
                            "Status update failed"
                        );
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
            }
        }
    }

    fn apply(&self, update: &StatusUpdate) -> SettlementResult<UpdateOutcome> {
        let repo = PaymentRepository::new(&self.db);
        let mut stale = false;
        let mut previous = None;
        let (payment, changed) =
            repo.update_with::<SettlementError>(&update.payment_id, |payment| {
                if !accepts(payment.status, update.status) {
                    stale = true;
                    return Ok(false);
                }
                // A linked transaction is only replaced by one ranking strictly higher.
                let other_tx = match (&payment.linked_tx_id, &update.tx_id) {
                    (Some(linked), Some(incoming)) => linked != incoming,
                    _ => false,
                };
                if other_tx && update.status.rank() <= payment.status.rank() {
                    return Ok(false);
                }
                let before = payment.clone();
                payment.status = update.status;
                if let Some(tx_id) = &update.tx_id {
                    payment.linked_tx_id = Some(tx_id.clone());
                }
                if let Some(confirmations) = update.confirmations {
                    payment.confirmations = confirmations;
                }
                previous = Some(before.status);
                Ok(*payment != before)
            })?;

        if stale {
            debug!(
                payment_id = %payment.payment_id,
                current = %payment.status,
                incoming = %update.status,
                source = update.source.as_str(),
                "Stale status update ignored"
            );
            return Ok(UpdateOutcome::Stale(payment));
        }
        if !changed || previous == Some(payment.status) {
            return Ok(UpdateOutcome::Unchanged(payment));
        }

        info!(
            payment_id = %payment.payment_id,
            status = %payment.status,
            confirmations = payment.confirmations,
            source = update.source.as_str(),
            "Payment status updated"
        );
        self.notifier
            .publish(Subject::Payment, payment.payment_id.clone(), payment.status);
        if payment.status.ends_watch() {
            self.tracker.cancel(&payment.receiving_address);
        }
        Ok(UpdateOutcome::Applied(payment))
    }
}
