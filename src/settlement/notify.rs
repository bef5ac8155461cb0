// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Status-changed notifications for payments and transfers.
//!
//! Consumers such as webhook forwarders subscribe to a broadcast channel.
//! Publishing never blocks and never fails; a lagging subscriber loses the
//! oldest events.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Default number of buffered events per subscriber.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Subject {
    Payment,
    Transfer,
}

/// A settlement status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChanged {
    pub subject: Subject,
    /// Payment id or transfer id
    pub id: String,
    /// Persisted status string
    pub status: String,
}

/// Broadcaster for [`StatusChanged`] events.
#[derive(Clone)]
pub struct SettlementNotifier {
    sender: broadcast::Sender<StatusChanged>,
}

impl Default for SettlementNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFY_CAPACITY)
    }
}

impl SettlementNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChanged> {
        self.sender.subscribe()
    }

    pub fn publish(&self, subject: Subject, id: impl Into<String>, status: impl ToString) {
        let event = StatusChanged {
            subject,
            id: id.into(),
            status: status.to_string(),
        };
        // No subscribers is fine
        if self.sender.send(event).is_err() {
            debug!("No status subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let notifier = SettlementNotifier::default();
        let mut rx = notifier.subscribe();

        notifier.publish(Subject::Transfer, "7", "completed");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.subject, Subject::Transfer);
        assert_eq!(event.id, "7");
        assert_eq!(event.status, "completed");
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let notifier = SettlementNotifier::new(1);
        notifier.publish(Subject::Payment, "abc", "waiting");
    }
}
