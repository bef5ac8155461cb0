// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Paynet Settlement - Bitcoin-confirmed payment and transfer settlement
//!
//! Watches receiving addresses for on-chain payments, drives each payment
//! through its status lifecycle and moves internal ledger balances exactly
//! once when a linked transaction reaches six confirmations.
//!
//! ## Modules
//!
//! - `api` - HTTP API handlers (Axum)
//! - `blockchain` - Bitcoin node client and confirmation types
//! - `tracker` - Address watches and confirmation polling
//! - `storage` - Settlement database (redb)
//! - `ledger` - Payout wallets and balance mutations
//! - `settlement` - Payment lifecycle and transfer settlement
//! - `webhook` - Signed payment provider callbacks

pub mod api;
pub mod blockchain;
pub mod config;
pub mod error;
pub mod ledger;
pub mod settlement;
pub mod state;
pub mod storage;
pub mod tracker;
pub mod webhook;
