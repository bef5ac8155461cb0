// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use paynet_settlement::{
    api::router,
    blockchain::RpcChainClient,
    config::{AppConfig, LogFormat, DEFAULT_LOG_FILTER},
    state::{AppState, ServiceOptions},
    storage::{SettlementDb, DATABASE_FILE},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() {
    let config = AppConfig::from_env().expect("Invalid configuration");
    init_tracing(config.log_format);

    let db_path = config.data_dir.join(DATABASE_FILE);
    let db = Arc::new(SettlementDb::open(&db_path).expect("Failed to open settlement database"));
    info!(path = %db_path.display(), "Settlement database opened");

    let chain = Arc::new(RpcChainClient::new(&config.rpc).expect("Invalid Bitcoin RPC settings"));

    let shutdown = CancellationToken::new();
    let options = ServiceOptions {
        network: config.network,
        base_url: config.base_url.clone(),
        webhook_secret: config.webhook_secret.clone(),
        tracker: config.tracker.clone(),
        transfer_policy: config.transfer_policy,
    };
    let (state, pipeline_task) = AppState::new(db, chain, options, shutdown.clone());
    if let Err(e) = state.resume() {
        warn!(error = %e, "Failed to resume in-flight work");
    }

    let app = router(state);
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind listener");
    info!(
        address = %addr,
        network = %config.network,
        "Paynet settlement listening (docs at /docs)"
    );

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
            signal.cancel();
        })
        .await
        .expect("HTTP server failed");

    shutdown.cancel();
    let _ = pipeline_task.await;
    info!("Paynet settlement stopped");
}
