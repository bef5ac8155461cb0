// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::{Path, State},
    Json,
};

use crate::error::ApiError;
use crate::settlement::PaymentStatusView;
use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/v1/payments/{payment_id}/status",
    tag = "Payments",
    params(("payment_id" = String, Path, description = "Payment ID")),
    responses(
        (status = 200, description = "Current payment status", body = PaymentStatusView),
        (status = 404, description = "Unknown payment")
    )
)]
pub async fn get_payment_status(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
) -> Result<Json<PaymentStatusView>, ApiError> {
    let view = state.payments.get_payment_status(&payment_id).await?;
    Ok(Json(view))
}

#[cfg(test)]
mod tests {
    use crate::api::router;
    use crate::settlement::{StatusUpdate, UpdateSource};
    use crate::state::testing::test_app;
    use crate::storage::PaymentStatus;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    async fn get_status(app: axum::Router, payment_id: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/payments/{payment_id}/status"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn new_payment_is_waiting() {
        let app = test_app();
        let payment = app
            .state
            .payments
            .create_payment(1, 10_000, "merchant", "BTC")
            .await
            .unwrap();

        let (status, body) = get_status(router(app.state.clone()), &payment.payment_id).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["payment_id"], payment.payment_id.as_str());
        assert_eq!(body["status"], "waiting");
        assert_eq!(body["confirmations"], 0);
    }

    #[tokio::test]
    async fn confirming_payment_reports_live_depth() {
        let app = test_app();
        let payment = app
            .state
            .payments
            .create_payment(1, 10_000, "merchant", "BTC")
            .await
            .unwrap();
        app.state
            .payments
            .update_payment_status(StatusUpdate {
                payment_id: payment.payment_id.clone(),
                status: PaymentStatus::PendingConfirmation(2),
                source: UpdateSource::Tracker,
                tx_id: Some("aa".repeat(32)),
                confirmations: Some(2),
            })
            .await
            .unwrap();
        app.chain.set_confirmations(&"aa".repeat(32), 4);

        let (status, body) = get_status(router(app.state.clone()), &payment.payment_id).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["confirmations"], 4);
    }

    #[tokio::test]
    async fn unknown_payment_is_not_found() {
        let app = test_app();
        let (status, body) = get_status(router(app.state.clone()), "missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }
}
