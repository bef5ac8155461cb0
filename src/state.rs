// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use bitcoin::Network;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::blockchain::ChainClient;
use crate::ledger::WalletLedger;
use crate::settlement::{
    ConfirmationPolicy, PaymentSettlement, SettlementNotifier, SettlementResult, StatusPipeline,
    TransferSettlement,
};
use crate::storage::SettlementDb;
use crate::tracker::{ConfirmationTracker, TrackerConfig};
use crate::webhook::WebhookIngress;

/// Knobs needed to wire the services together.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub network: Network,
    pub base_url: String,
    pub webhook_secret: String,
    pub tracker: TrackerConfig,
    pub transfer_policy: ConfirmationPolicy,
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SettlementDb>,
    pub tracker: Arc<ConfirmationTracker>,
    pub notifier: SettlementNotifier,
    pub ledger: WalletLedger,
    pub payments: PaymentSettlement,
    pub transfers: TransferSettlement,
    pub webhook: WebhookIngress,
}

impl AppState {
    /// Wire the services and spawn the status pipeline.
    ///
    /// Every background task stops when `shutdown` is cancelled. Must be
    /// called from within a tokio runtime.
    pub fn new(
        db: Arc<SettlementDb>,
        chain: Arc<dyn ChainClient>,
        options: ServiceOptions,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let notifier = SettlementNotifier::default();
        let tracker = Arc::new(ConfirmationTracker::new(
            Arc::clone(&chain),
            options.tracker,
            shutdown.child_token(),
        ));
        let (pipeline, pipeline_task) = StatusPipeline::spawn(
            Arc::clone(&db),
            Arc::clone(&tracker),
            notifier.clone(),
            shutdown.clone(),
        );
        let ledger = WalletLedger::new(Arc::clone(&db), Arc::clone(&chain));
        let payments = PaymentSettlement::new(
            Arc::clone(&db),
            Arc::clone(&chain),
            Arc::clone(&tracker),
            pipeline,
            options.network,
            options.base_url,
        );
        let transfers = TransferSettlement::new(
            Arc::clone(&db),
            ledger.clone(),
            chain,
            notifier.clone(),
            options.transfer_policy,
            shutdown,
        );
        let webhook = WebhookIngress::new(options.webhook_secret, payments.clone());

        let state = Self {
            db,
            tracker,
            notifier,
            ledger,
            payments,
            transfers,
            webhook,
        };
        (state, pipeline_task)
    }

    /// Pick up in-flight work left behind by a previous run.
    pub fn resume(&self) -> SettlementResult<()> {
        let watches = self.payments.resume_watches()?;
        let transfers = self.transfers.resume_pending()?;
        info!(watches, transfers, "Resumed in-flight settlement work");
        Ok(())
    }
}
