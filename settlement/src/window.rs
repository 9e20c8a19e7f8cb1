//! Vendor settlement window management
//!
//! Each vendor has at most one open window. A window opens with the vendor's
//! first delivered transaction and becomes due when either
//!
//! - its end time has passed and it holds at least `min_transactions`, or
//! - it holds `max_transactions`.
//!
//! An expired window below the minimum is carried into the next period.
//! Delivery is at-least-once, so every transaction id is counted once. The
//! [`SettlementStore`] remembers every id ever windowed; open windows are
//! cached in memory and reloaded from the store on open.

use crate::{
    config::WindowConfig,
    store::SettlementStore,
    types::{SettlementBatch, SettlementStatus},
    Error, Result,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use voucher_ledger::{types::checked_add, Transaction, TransactionId, VendorId};

/// Open settlement window for one vendor
#[derive(Debug, Clone)]
pub struct SettlementWindow {
    /// Window ID
    pub window_id: Uuid,

    /// Vendor
    pub vendor_id: VendorId,

    /// Window start time
    pub start_time: DateTime<Utc>,

    /// Window end time
    pub end_time: DateTime<Utc>,

    /// Collected transactions, in delivery order
    pub transaction_ids: Vec<TransactionId>,

    /// Sum of collected amounts
    pub total_amount: Decimal,
}

/// Result of recording a delivered transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Added to the vendor's open window
    Added,
    /// Already counted; ignored
    Duplicate,
}

/// Window manager
#[derive(Debug)]
pub struct WindowManager {
    open: Mutex<HashMap<VendorId, SettlementWindow>>,

    store: Arc<SettlementStore>,

    /// Window duration
    duration: Duration,

    /// Minimum transactions for payout
    min_transactions: usize,

    /// Transactions that make a window due immediately
    max_transactions: usize,
}

impl WindowManager {
    /// Create a window manager, resuming the windows left open in `store`
    pub fn open(
        store: Arc<SettlementStore>,
        duration_seconds: u64,
        min_transactions: usize,
        max_transactions: usize,
    ) -> Result<Self> {
        let open: HashMap<_, _> = store
            .load_windows()?
            .into_iter()
            .map(|w| (w.vendor_id.clone(), w))
            .collect();

        if !open.is_empty() {
            tracing::info!(windows = open.len(), "Resumed open settlement windows");
        }

        Ok(Self {
            open: Mutex::new(open),
            store,
            duration: Duration::seconds(duration_seconds as i64),
            min_transactions,
            max_transactions,
        })
    }

    /// Create from configuration
    pub fn from_config(config: &WindowConfig, store: Arc<SettlementStore>) -> Result<Self> {
        Self::open(
            store,
            config.duration_seconds,
            config.min_transactions,
            config.max_transactions,
        )
    }

    /// Add a delivered transaction to its vendor's window
    ///
    /// Returns once the transaction is durable.
    pub async fn record(&self, tx: &Transaction, now: DateTime<Utc>) -> Result<RecordOutcome> {
        let mut open = self.open.lock().await;

        if self.store.is_seen(tx.id)? {
            return Ok(RecordOutcome::Duplicate);
        }

        let is_new = !open.contains_key(&tx.vendor_id);
        let duration = self.duration;
        let window = open.entry(tx.vendor_id.clone()).or_insert_with(|| SettlementWindow {
            window_id: Uuid::now_v7(),
            vendor_id: tx.vendor_id.clone(),
            start_time: now,
            end_time: now + duration,
            transaction_ids: Vec::new(),
            total_amount: Decimal::ZERO,
        });

        let previous_total = window.total_amount;
        let persisted = checked_add(previous_total, tx.amount, "Settlement window total")
            .map_err(Error::from)
            .and_then(|total| {
                window.total_amount = total;
                window.transaction_ids.push(tx.id);
                self.store.record(window).map_err(|e| {
                    window.transaction_ids.pop();
                    window.total_amount = previous_total;
                    e
                })
            });

        if let Err(e) = persisted {
            if is_new {
                open.remove(&tx.vendor_id);
            }
            return Err(e);
        }

        if is_new {
            if let Some(window) = open.get(&tx.vendor_id) {
                tracing::info!(
                    window_id = %window.window_id,
                    vendor_id = %window.vendor_id,
                    ends_at = %window.end_time,
                    "Opened settlement window"
                );
            }
        }
        Ok(RecordOutcome::Added)
    }

    /// Vendors whose windows are due at `now`
    ///
    /// Expired windows below the minimum get their end time pushed forward by
    /// whole periods.
    pub async fn due_vendors(&self, now: DateTime<Utc>) -> Result<Vec<VendorId>> {
        let mut open = self.open.lock().await;
        let mut due = Vec::new();
        let mut carried = Vec::new();

        for window in open.values_mut() {
            let count = window.transaction_ids.len();
            if count >= self.max_transactions {
                due.push(window.vendor_id.clone());
                continue;
            }
            if now < window.end_time {
                continue;
            }
            if count >= self.min_transactions {
                due.push(window.vendor_id.clone());
            } else {
                while window.end_time <= now {
                    window.end_time += self.duration;
                }
                tracing::debug!(
                    window_id = %window.window_id,
                    vendor_id = %window.vendor_id,
                    count,
                    ends_at = %window.end_time,
                    "Window below minimum, carried over"
                );
                carried.push(window.vendor_id.clone());
            }
        }

        self.store
            .update_headers(carried.iter().filter_map(|id| open.get(id)))?;

        due.sort();
        Ok(due)
    }

    /// Close a vendor's window at `now` and record its payout
    pub async fn close_window(
        &self,
        vendor_id: &VendorId,
        now: DateTime<Utc>,
    ) -> Result<SettlementBatch> {
        let mut open = self.open.lock().await;

        let window = open
            .get(vendor_id)
            .ok_or_else(|| Error::NoOpenWindow(vendor_id.clone()))?;

        let batch = SettlementBatch {
            batch_id: Uuid::now_v7(),
            vendor_id: window.vendor_id.clone(),
            window_start: window.start_time,
            window_end: now,
            transaction_ids: window.transaction_ids.clone(),
            transaction_count: window.transaction_ids.len(),
            total_amount: window.total_amount,
            status: SettlementStatus::Settled,
            settled_at: Some(now),
        };
        self.store.settle(window, &batch)?;
        open.remove(vendor_id);

        tracing::info!(
            batch_id = %batch.batch_id,
            vendor_id = %vendor_id,
            transactions = batch.transaction_count,
            total = %batch.total_amount,
            "Closed settlement window"
        );

        Ok(batch)
    }

    /// Current open window for a vendor
    pub async fn get_window(&self, vendor_id: &VendorId) -> Option<SettlementWindow> {
        self.open.lock().await.get(vendor_id).cloned()
    }

    /// All open windows, by vendor id
    pub async fn open_windows(&self) -> Vec<SettlementWindow> {
        let open = self.open.lock().await;
        let mut windows: Vec<_> = open.values().cloned().collect();
        windows.sort_by(|a, b| a.vendor_id.cmp(&b.vendor_id));
        windows
    }
}
