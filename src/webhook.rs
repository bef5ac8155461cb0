// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Webhook Ingress
//!
//! Push-based payment status updates from an external payment provider.
//!
//! The provider signs the raw request body with HMAC-SHA256 under a shared
//! secret and sends the hex digest in `X-Webhook-Signature`. The digest is
//! checked in constant time before the body is parsed. Accepted updates go
//! through the same status pipeline as tracker events, so a webhook can
//! finish a payment but never regress one.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::settlement::{PaymentSettlement, SettlementError, StatusUpdate, UpdateOutcome};
use crate::storage::PaymentStatus;

/// Header carrying the hex HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

type HmacSha256 = Hmac<Sha256>;

/// Body of a payment webhook.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct WebhookPayload {
    pub payment_id: String,
    /// One of the persisted payment status strings
    #[schema(example = "completed")]
    pub status: String,
    /// Receiving address the provider saw the payment on
    #[serde(default)]
    pub address: Option<String>,
}

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing webhook signature")]
    MissingSignature,

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("invalid webhook payload: {0}")]
    Malformed(String),

    #[error("address {got} does not match payment {payment_id}")]
    AddressMismatch { payment_id: String, got: String },

    #[error(transparent)]
    Settlement(#[from] SettlementError),
}

fn keyed_mac(secret: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length")
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = keyed_mac(secret);
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies signed webhooks and feeds them into payment settlement.
#[derive(Clone)]
pub struct WebhookIngress {
    secret: Vec<u8>,
    payments: PaymentSettlement,
}

impl WebhookIngress {
    pub fn new(secret: impl Into<Vec<u8>>, payments: PaymentSettlement) -> Self {
        Self {
            secret: secret.into(),
            payments,
        }
    }

    /// Constant-time check of a hex signature over `body`.
    pub fn verify_signature(&self, signature: &str, body: &[u8]) -> Result<(), WebhookError> {
        let expected = hex::decode(signature.trim()).map_err(|_| WebhookError::InvalidSignature)?;
        let mut mac = keyed_mac(&self.secret);
        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| WebhookError::InvalidSignature)
    }

    /// Verify, parse and apply one webhook delivery.
    pub async fn handle_webhook(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<UpdateOutcome, WebhookError> {
        let signature = signature.ok_or(WebhookError::MissingSignature)?;
        if let Err(e) = self.verify_signature(signature, body) {
            warn!("Rejected webhook with bad signature");
            return Err(e);
        }

        let payload: WebhookPayload =
            serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))?;
        let status = payload
            .status
            .parse::<PaymentStatus>()
            .map_err(|e| WebhookError::Malformed(e.to_string()))?;

        if let Some(address) = payload.address.as_deref().filter(|a| !a.is_empty()) {
            let payment = self.payments.get_payment(&payload.payment_id)?;
            if payment.receiving_address != address {
                warn!(
                    payment_id = %payload.payment_id,
                    address = %address,
                    "Webhook address does not match payment"
                );
                return Err(WebhookError::AddressMismatch {
                    payment_id: payload.payment_id,
                    got: address.to_string(),
                });
            }
        }

        let outcome = self
            .payments
            .update_payment_status(StatusUpdate::from_webhook(payload.payment_id.clone(), status))
            .await?;
        info!(
            payment_id = %payload.payment_id,
            status = %status,
            applied = matches!(outcome, UpdateOutcome::Applied(_)),
            "Webhook processed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::mock::MockChainClient;
    use crate::settlement::{SettlementNotifier, StatusPipeline};
    use crate::storage::{Payment, SettlementDb};
    use crate::tracker::{ConfirmationTracker, TrackerConfig};
    use bitcoin::Network;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const SECRET: &[u8] = b"whsec_test";

    struct Fixture {
        ingress: WebhookIngress,
        payments: PaymentSettlement,
        shutdown: CancellationToken,
        _dir: tempfile::TempDir,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(SettlementDb::open(&dir.path().join("webhook.redb")).unwrap());
        let chain = Arc::new(MockChainClient::new());
        let shutdown = CancellationToken::new();
        let tracker = Arc::new(ConfirmationTracker::new(
            chain.clone(),
            TrackerConfig {
                poll_interval: Duration::from_secs(3600),
                retry_backoff: Duration::from_secs(3600),
                ..Default::default()
            },
            shutdown.clone(),
        ));
        let (pipeline, _) = StatusPipeline::spawn(
            Arc::clone(&db),
            Arc::clone(&tracker),
            SettlementNotifier::default(),
            shutdown.clone(),
        );
        let payments = PaymentSettlement::new(
            Arc::clone(&db),
            chain,
            tracker,
            pipeline,
            Network::Regtest,
            "http://localhost:8080",
        );
        Fixture {
            ingress: WebhookIngress::new(SECRET, payments.clone()),
            payments,
            shutdown,
            _dir: dir,
        }
    }

    async fn new_payment(f: &Fixture) -> Payment {
        f.payments.create_payment(1, 5_000, "merchant", "BTC").await.unwrap()
    }

    fn body(payment_id: &str, status: &str, address: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "payment_id": payment_id,
            "status": status,
            "address": address,
        }))
        .unwrap()
    }

    #[test]
    fn signature_round_trip() {
        let sig = sign(b"k", b"payload");
        assert_eq!(sig.len(), 64);
        assert_ne!(sig, sign(b"k", b"payload!"));
        assert_ne!(sig, sign(b"other", b"payload"));
    }

    #[tokio::test]
    async fn valid_webhook_completes_payment() {
        let f = fixture();
        let payment = new_payment(&f).await;
        let raw = body(&payment.payment_id, "completed", &payment.receiving_address);

        let outcome = f
            .ingress
            .handle_webhook(Some(&sign(SECRET, &raw)), &raw)
            .await
            .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Applied(_)));
        assert_eq!(
            f.payments.get_payment(&payment.payment_id).unwrap().status,
            PaymentStatus::Completed
        );
    }

    #[tokio::test]
    async fn wrong_signature_leaves_status_unchanged() {
        let f = fixture();
        let payment = new_payment(&f).await;
        let raw = body(&payment.payment_id, "completed", &payment.receiving_address);

        let err = f
            .ingress
            .handle_webhook(Some(&sign(b"other-secret", &raw)), &raw)
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature));

        let err = f.ingress.handle_webhook(Some("zz-not-hex"), &raw).await.unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature));

        let err = f.ingress.handle_webhook(None, &raw).await.unwrap_err();
        assert!(matches!(err, WebhookError::MissingSignature));

        assert_eq!(
            f.payments.get_payment(&payment.payment_id).unwrap().status,
            PaymentStatus::Waiting
        );
    }

    #[tokio::test]
    async fn malformed_bodies_are_rejected_after_verification() {
        let f = fixture();
        let raw = b"{not json".to_vec();
        let err = f
            .ingress
            .handle_webhook(Some(&sign(SECRET, &raw)), &raw)
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::Malformed(_)));

        let payment = new_payment(&f).await;
        let raw = body(&payment.payment_id, "settled", "");
        let err = f
            .ingress
            .handle_webhook(Some(&sign(SECRET, &raw)), &raw)
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::Malformed(_)));
    }

    #[tokio::test]
    async fn address_must_match_payment() {
        let f = fixture();
        let payment = new_payment(&f).await;
        let raw = body(&payment.payment_id, "completed", "bcrt1-someone-else");

        let err = f
            .ingress
            .handle_webhook(Some(&sign(SECRET, &raw)), &raw)
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::AddressMismatch { .. }));
    }

    #[tokio::test]
    async fn unknown_payment_is_not_found() {
        let f = fixture();
        let raw = body("00ff", "completed", "");
        let err = f
            .ingress
            .handle_webhook(Some(&sign(SECRET, &raw)), &raw)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WebhookError::Settlement(SettlementError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn terminal_status_cannot_be_replaced() {
        let f = fixture();
        let payment = new_payment(&f).await;
        for status in ["failed", "completed", "pending"] {
            let raw = body(&payment.payment_id, status, "");
            f.ingress
                .handle_webhook(Some(&sign(SECRET, &raw)), &raw)
                .await
                .unwrap();
        }
        assert_eq!(
            f.payments.get_payment(&payment.payment_id).unwrap().status,
            PaymentStatus::Failed
        );
    }
}
