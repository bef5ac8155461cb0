// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names, default values and the
//! [`AppConfig`] loaded from them once at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding `settlement.redb` | `./data` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `BITCOIN_RPC_URL` | Node JSON-RPC endpoint | `http://127.0.0.1:18334` |
//! | `BITCOIN_RPC_USER` | Node RPC user | empty |
//! | `BITCOIN_RPC_PASS` | Node RPC password | empty |
//! | `BITCOIN_NETWORK` | `mainnet`, `testnet`, `signet` or `regtest` | `testnet` |
//! | `WEBHOOK_SECRET` | HMAC-SHA256 secret shared with the payment provider | Required |
//! | `BASE_URL` | Prefix for payment URLs | `http://localhost:8080` |
//! | `WATCH_POLL_INTERVAL_SECS` | Seconds between address polls | `60` |
//! | `WATCH_RETRY_BACKOFF_SECS` | Seconds to wait after a node error | `10` |
//! | `TRANSFER_CONFIRMATION_POLICY` | `fail_fast` or `retry` | `retry` |
//! | `TRANSFER_RETRY_INTERVAL_SECS` | Seconds between transfer confirmation checks | `60` |
//! | `TRANSFER_RETRY_MAX_ATTEMPTS` | Checks before a transfer is failed | `60` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bitcoin::Network;

use crate::blockchain::{network_from_name, RpcConfig};
use crate::settlement::{ConfirmationPolicy, DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_MAX_ATTEMPTS};
use crate::tracker::TrackerConfig;

/// Directory holding the settlement database.
pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const BITCOIN_RPC_URL_ENV: &str = "BITCOIN_RPC_URL";
pub const BITCOIN_RPC_USER_ENV: &str = "BITCOIN_RPC_USER";
pub const BITCOIN_RPC_PASS_ENV: &str = "BITCOIN_RPC_PASS";
pub const BITCOIN_NETWORK_ENV: &str = "BITCOIN_NETWORK";

/// Shared secret for webhook signatures. There is no default; startup
/// fails without it.
pub const WEBHOOK_SECRET_ENV: &str = "WEBHOOK_SECRET";

/// Prefix for payment URLs, which take the form `{BASE_URL}/pay/{payment_id}`.
pub const BASE_URL_ENV: &str = "BASE_URL";
pub const WATCH_POLL_INTERVAL_ENV: &str = "WATCH_POLL_INTERVAL_SECS";
pub const WATCH_RETRY_BACKOFF_ENV: &str = "WATCH_RETRY_BACKOFF_SECS";
pub const TRANSFER_POLICY_ENV: &str = "TRANSFER_CONFIRMATION_POLICY";
pub const TRANSFER_RETRY_INTERVAL_ENV: &str = "TRANSFER_RETRY_INTERVAL_SECS";
pub const TRANSFER_RETRY_MAX_ATTEMPTS_ENV: &str = "TRANSFER_RETRY_MAX_ATTEMPTS";

/// Environment variable name for log output format.
///
/// Values: `json` for structured output, anything else for human-readable.
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:18334";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Everything the service reads from its environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub rpc: RpcConfig,
    pub network: Network,
    pub webhook_secret: String,
    pub base_url: String,
    pub tracker: TrackerConfig,
    pub transfer_policy: ConfirmationPolicy,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let webhook_secret = get(WEBHOOK_SECRET_ENV).ok_or(ConfigError::Missing(WEBHOOK_SECRET_ENV))?;

        let tracker = TrackerConfig {
            poll_interval: secs(&get, WATCH_POLL_INTERVAL_ENV)?
                .unwrap_or(TrackerConfig::default().poll_interval),
            retry_backoff: secs(&get, WATCH_RETRY_BACKOFF_ENV)?
                .unwrap_or(TrackerConfig::default().retry_backoff),
            ..Default::default()
        };

        let transfer_policy = match get(TRANSFER_POLICY_ENV).as_deref().map(str::trim) {
            None | Some("retry") => ConfirmationPolicy::Retry {
                interval: secs(&get, TRANSFER_RETRY_INTERVAL_ENV)?.unwrap_or(DEFAULT_RETRY_INTERVAL),
                max_attempts: parsed(&get, TRANSFER_RETRY_MAX_ATTEMPTS_ENV)?
                    .unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS),
            },
            Some("fail_fast") => ConfirmationPolicy::FailFast,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: TRANSFER_POLICY_ENV,
                    value: other.to_string(),
                    reason: "expected fail_fast or retry".to_string(),
                })
            }
        };

        let log_format = match get(LOG_FORMAT_ENV).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            data_dir: get(DATA_DIR_ENV)
                .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string())
                .into(),
            host: get(HOST_ENV).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parsed(&get, PORT_ENV)?.unwrap_or(DEFAULT_PORT),
            rpc: RpcConfig {
                url: get(BITCOIN_RPC_URL_ENV).unwrap_or_else(|| DEFAULT_RPC_URL.to_string()),
                user: get(BITCOIN_RPC_USER_ENV).unwrap_or_default(),
                pass: get(BITCOIN_RPC_PASS_ENV).unwrap_or_default(),
            },
            network: get(BITCOIN_NETWORK_ENV)
                .map(|name| network_from_name(&name))
                .unwrap_or(Network::Testnet),
            webhook_secret,
            base_url: get(BASE_URL_ENV)
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            tracker,
            transfer_policy,
            log_format,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parsed<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(var)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

/// A whole number of seconds, at least one.
fn secs(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    match parsed::<u64>(get, var)? {
        Some(0) => Err(ConfigError::Invalid {
            var,
            value: "0".to_string(),
            reason: "must be at least 1 second".to_string(),
        }),
        other => Ok(other.map(Duration::from_secs)),
    }
}
