// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Repository layer providing typed access to the settlement database.
//!
//! Each repository borrows the [`SettlementDb`](super::SettlementDb) and
//! offers CRUD plus the transactional read-modify-write helpers its entity
//! needs.

pub mod payments;
pub mod transfers;
pub mod wallets;

pub use payments::{Payment, PaymentRepository, PaymentStatus, UnknownPaymentStatus};
pub use transfers::{NewTransfer, Transfer, TransferRepository, TransferStatus, TransferType};
pub use wallets::{NewWallet, PayoutWallet, WalletRepository, WalletUpdate};
