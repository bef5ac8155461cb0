// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ownership checks for stored records.
//!
//! Transfers may only draw from a wallet the sender owns; payments and
//! wallets carry their owner so callers can enforce the same rule.

/// Trait for resources that have an owner.
pub trait OwnedResource {
    /// Get the owner's user ID.
    fn owner_user_id(&self) -> u64;

    /// Human-readable label used in denial messages.
    fn resource_label(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("user {user_id} does not own {resource}")]
pub struct PermissionDenied {
    pub user_id: u64,
    pub resource: String,
}

/// Trait for enforcing ownership on loaded records.
pub trait OwnershipEnforcer {
    /// Verify that `user_id` owns this resource.
    fn verify_ownership(&self, user_id: u64) -> Result<(), PermissionDenied>;
}

impl<T: OwnedResource> OwnershipEnforcer for T {
    fn verify_ownership(&self, user_id: u64) -> Result<(), PermissionDenied> {
        if self.owner_user_id() == user_id {
            Ok(())
        } else {
            Err(PermissionDenied {
                user_id,
                resource: self.resource_label(),
            })
        }
    }
}
