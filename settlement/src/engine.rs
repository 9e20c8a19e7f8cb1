//! Vendor settlement engine
//!
//! Registered with the ledger's notifier as a [`SettlementSink`]. Delivered
//! transactions accumulate in per-vendor windows; a scheduler task closes due
//! windows and records one payout batch per vendor. Windows, the ids already
//! counted and the payout history live in a [`SettlementStore`], so a restart
//! resumes where it stopped and redelivered transactions stay deduplicated.

use crate::{
    config::Config,
    store::SettlementStore,
    types::{PendingSettlement, SettlementBatch},
    window::{RecordOutcome, WindowManager},
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use voucher_ledger::{SettlementSink, Transaction, VendorId};

/// Vendor settlement engine
#[derive(Debug)]
pub struct VendorSettlementEngine {
    /// Window manager
    windows: WindowManager,

    /// Open windows and payout history
    store: Arc<SettlementStore>,

    /// Configuration
    config: Config,
}

impl VendorSettlementEngine {
    /// Open the settlement engine, resuming persisted windows
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(SettlementStore::open(&config)?);
        Ok(Self {
            windows: WindowManager::from_config(&config.window, store.clone())?,
            store,
            config,
        })
    }

    /// Settle every window due at `now`
    pub async fn settle_due(&self, now: DateTime<Utc>) -> Result<Vec<SettlementBatch>> {
        let due = self.windows.due_vendors(now).await?;
        let mut batches = Vec::with_capacity(due.len());

        for vendor_id in due {
            batches.push(self.windows.close_window(&vendor_id, now).await?);
        }

        if !batches.is_empty() {
            tracing::info!(batches = batches.len(), "Settlement round complete");
        }
        Ok(batches)
    }

    /// Close one vendor's window ahead of schedule (ops trigger)
    pub async fn settle_vendor(&self, vendor_id: &VendorId) -> Result<SettlementBatch> {
        self.windows.close_window(vendor_id, Utc::now()).await
    }

    /// Recorded payouts, optionally for one vendor, oldest first
    pub fn history(&self, vendor_id: Option<&VendorId>) -> Result<Vec<SettlementBatch>> {
        self.store.batches(vendor_id)
    }

    /// What a vendor has collected in its open window
    pub async fn pending(&self, vendor_id: &VendorId) -> Option<PendingSettlement> {
        self.windows
            .get_window(vendor_id)
            .await
            .map(|w| PendingSettlement {
                vendor_id: w.vendor_id,
                window_start: w.start_time,
                window_end: w.end_time,
                transaction_count: w.transaction_ids.len(),
                total_amount: w.total_amount,
            })
    }

    /// Window manager
    pub fn windows(&self) -> &WindowManager {
        &self.windows
    }

    /// Spawn the window scheduler
    ///
    /// Checks for due windows every `window.check_interval_seconds`; abort the
    /// returned handle to stop it.
    pub fn start_scheduler(self: Arc<Self>) -> JoinHandle<()> {
        let period = tokio::time::Duration::from_secs(self.config.window.check_interval_seconds.max(1));

        tokio::spawn(async move {
            tracing::info!(interval_secs = period.as_secs(), "Starting settlement scheduler");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if let Err(e) = self.settle_due(Utc::now()).await {
                    tracing::error!(error = %e, "Settlement round failed");
                }
            }
        })
    }
}

#[async_trait]
impl SettlementSink for VendorSettlementEngine {
    fn name(&self) -> &str {
        "vendor-settlement"
    }

    async fn deliver(&self, tx: &Transaction) -> voucher_ledger::Result<()> {
        let outcome = self.windows.record(tx, Utc::now()).await.map_err(|e| {
            tracing::warn!(transaction_id = %tx.id, error = %e, "Failed to window transaction");
            voucher_ledger::Error::Delivery(e.to_string())
        })?;

        match outcome {
            RecordOutcome::Added => {
                tracing::debug!(transaction_id = %tx.id, vendor_id = %tx.vendor_id, "Transaction windowed");
            }
            RecordOutcome::Duplicate => {
                tracing::debug!(transaction_id = %tx.id, "Redelivered transaction ignored");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SettlementStatus;
    use crate::window::tests::transaction;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn config(dir: &TempDir, duration_seconds: u64, min_transactions: usize) -> Config {
        let mut config = Config::with_root(dir.path());
        config.window.duration_seconds = duration_seconds;
        config.window.min_transactions = min_transactions;
        config
    }

    #[tokio::test]
    async fn test_settle_due_pays_each_vendor_once() {
        let dir = TempDir::new().unwrap();
        let engine = VendorSettlementEngine::open(config(&dir, 3600, 1)).unwrap();
        let a = transaction("V001", 500);
        let b = transaction("V001", 300);
        let c = transaction("V002", 200);
        for tx in [&a, &b, &c, &a] {
            engine.deliver(tx).await.unwrap();
        }

        assert!(engine.settle_due(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + Duration::seconds(3601);
        let batches = engine.settle_due(later).await.unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].vendor_id, VendorId::new("V001"));
        assert_eq!(batches[0].transaction_ids, vec![a.id, b.id]);
        assert_eq!(batches[0].total_amount, Decimal::new(800, 0));
        assert_eq!(batches[0].status, SettlementStatus::Settled);
        assert_eq!(batches[1].total_amount, Decimal::new(200, 0));

        // Nothing left to settle
        assert!(engine.settle_due(later).await.unwrap().is_empty());
        assert_eq!(engine.history(None).unwrap().len(), 2);
        assert_eq!(engine.history(Some(&VendorId::new("V002"))).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_settle_vendor_on_demand() {
        let dir = TempDir::new().unwrap();
        let engine = VendorSettlementEngine::open(config(&dir, 3600, 5)).unwrap();
        engine.deliver(&transaction("V001", 120)).await.unwrap();

        let pending = engine.pending(&VendorId::new("V001")).await.unwrap();
        assert_eq!(pending.transaction_count, 1);
        assert_eq!(pending.total_amount, Decimal::new(120, 0));

        let batch = engine.settle_vendor(&VendorId::new("V001")).await.unwrap();
        assert_eq!(batch.transaction_count, 1);
        assert!(engine.pending(&VendorId::new("V001")).await.is_none());

        assert!(matches!(
            engine.settle_vendor(&VendorId::new("V001")).await,
            Err(crate::Error::NoOpenWindow(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_keeps_pending_and_history() {
        let dir = TempDir::new().unwrap();
        let paid = transaction("V001", 300);
        let open = transaction("V002", 75);
        let batch = {
            let engine = VendorSettlementEngine::open(config(&dir, 3600, 1)).unwrap();
            engine.deliver(&paid).await.unwrap();
            engine.deliver(&open).await.unwrap();
            engine.settle_vendor(&paid.vendor_id).await.unwrap()
        };

        let engine = VendorSettlementEngine::open(config(&dir, 3600, 1)).unwrap();
        assert_eq!(engine.history(None).unwrap(), vec![batch]);

        let pending = engine.pending(&open.vendor_id).await.unwrap();
        assert_eq!(pending.total_amount, Decimal::new(75, 0));

        // Redelivery after the restart is still counted once
        engine.deliver(&paid).await.unwrap();
        engine.deliver(&open).await.unwrap();
        assert!(engine.pending(&paid.vendor_id).await.is_none());
        assert_eq!(engine.pending(&open.vendor_id).await.unwrap().transaction_count, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, 0, 1);
        assert!(VendorSettlementEngine::open(config).is_err());
    }
}
