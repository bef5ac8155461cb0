// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::settlement::UpdateOutcome;
use crate::state::AppState;
use crate::webhook::{WebhookPayload, SIGNATURE_HEADER};

/// Acknowledgement returned for an accepted webhook.
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub payment_id: String,
    /// Payment status after the update was merged
    pub status: String,
    /// False when the update was a duplicate or older than the stored status
    pub applied: bool,
}

/// Payment provider status callback.
///
/// The raw body must be signed with the shared secret; see
/// `X-Webhook-Signature`.
#[utoipa::path(
    post,
    path = "/v1/webhooks/payment",
    tag = "Webhooks",
    request_body = WebhookPayload,
    params(
        ("X-Webhook-Signature" = String, Header, description = "Hex HMAC-SHA256 of the raw body")
    ),
    responses(
        (status = 200, description = "Update accepted", body = WebhookAck),
        (status = 400, description = "Malformed payload"),
        (status = 401, description = "Missing or invalid signature"),
        (status = 404, description = "Unknown payment"),
        (status = 422, description = "Address does not match the payment")
    )
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let outcome = state.webhook.handle_webhook(signature, &body).await?;
    let applied = matches!(outcome, UpdateOutcome::Applied(_));
    let payment = outcome.payment();

    Ok(Json(WebhookAck {
        payment_id: payment.payment_id.clone(),
        status: payment.status.to_string(),
        applied,
    }))
}
