//! Realtime push hub
//!
//! A [`SettlementSink`] that fans committed payments out to dashboard
//! subscribers over a `tokio::sync::broadcast` channel. Subscribers that fall
//! more than `push.capacity` events behind skip ahead; the ledger remains the
//! source of truth for history.

use crate::types::{PaymentNotification, PushFilter};
use async_trait::async_trait;
use tokio::sync::broadcast;
use voucher_ledger::{SettlementSink, Transaction};

/// Broadcast sink for realtime dashboards
#[derive(Debug, Clone)]
pub struct PushHub {
    sender: broadcast::Sender<PaymentNotification>,
}

impl PushHub {
    /// Create hub with a per-subscriber buffer of `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to payments matching the filter
    pub fn subscribe(&self, filter: PushFilter) -> PushSubscription {
        PushSubscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish one event; returns how many subscribers it reached
    pub fn publish(&self, event: PaymentNotification) -> usize {
        // No subscribers is not an error
        self.sender.send(event).unwrap_or(0)
    }
}

#[async_trait]
impl SettlementSink for PushHub {
    fn name(&self) -> &str {
        "push-hub"
    }

    async fn deliver(&self, tx: &Transaction) -> voucher_ledger::Result<()> {
        let reached = self.publish(PaymentNotification::from(tx));
        tracing::debug!(transaction_id = %tx.id, subscribers = reached, "Pushed payment");
        Ok(())
    }
}

/// Filtered stream of payment events
#[derive(Debug)]
pub struct PushSubscription {
    receiver: broadcast::Receiver<PaymentNotification>,
    filter: PushFilter,
}

impl PushSubscription {
    /// Next matching event, or `None` once the hub is gone
    pub async fn recv(&mut self) -> Option<PaymentNotification> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, filter = ?self.filter, "Push subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Subscription filter
    pub fn filter(&self) -> &PushFilter {
        &self.filter
    }
}
