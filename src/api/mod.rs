// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{settlement::PaymentStatusView, state::AppState, webhook::WebhookPayload};

pub mod health;
pub mod payments;
pub mod webhook;

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/webhooks/payment", post(webhook::payment_webhook))
        .route(
            "/payments/{payment_id}/status",
            get(payments::get_payment_status),
        );

    Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .nest("/v1", v1_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        health::liveness,
        health::readiness,
        webhook::payment_webhook,
        payments::get_payment_status
    ),
    components(
        schemas(
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse,
            webhook::WebhookAck,
            WebhookPayload,
            PaymentStatusView
        )
    ),
    tags(
        (name = "Health", description = "Liveness and readiness probes"),
        (name = "Webhooks", description = "Signed payment provider callbacks"),
        (name = "Payments", description = "Payment status lookup")
    )
)]
struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::test_app;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn router_builds_with_all_routes() {
        let app = test_app();
        let _ = router(app.state.clone()).into_make_service();
    }

    #[tokio::test]
    async fn openapi_document_lists_routes() {
        let app = test_app();
        let response = router(app.state.clone())
            .oneshot(
                Request::builder()
                    .uri("/api-doc/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(doc["paths"]["/v1/webhooks/payment"].is_object());
        assert!(doc["paths"]["/v1/payments/{payment_id}/status"].is_object());
    }
}
