//! Settlement notifier: outbox dispatcher actor
//!
//! Committed transactions land in the `outbox` column family in the same
//! `WriteBatch` as the payment. This actor drains the outbox in sequence order
//! and hands each transaction to every registered [`SettlementSink`]. An entry
//! is removed only after all sinks accept it, so delivery is at-least-once and
//! in commit order.
//!
//! ```text
//! LedgerEngine ──commit──▶ RocksDB outbox
//!      │                        ▲
//!      └──wake (try_send)──▶ NotifierActor ──deliver──▶ sinks
//! ```
//!
//! The commit path only ever calls [`NotifierHandle::wake`], which never
//! blocks; a slow or failing sink cannot stall a payment.

use crate::config::NotifierConfig;
use crate::metrics::Metrics;
use crate::store::VoucherStore;
use crate::types::Transaction;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Duration, Instant};

/// Downstream consumer of committed transactions
#[async_trait]
pub trait SettlementSink: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Accept one committed transaction
    ///
    /// May be called more than once for the same transaction.
    async fn deliver(&self, tx: &Transaction) -> Result<()>;
}

/// Message sent to the notifier actor
enum NotifierMessage {
    /// New outbox entries are available
    Wake,

    /// Register a sink
    Subscribe {
        sink: Arc<dyn SettlementSink>,
        response: oneshot::Sender<()>,
    },

    /// Drain the outbox now
    Flush {
        response: oneshot::Sender<Result<usize>>,
    },

    /// Stop the actor
    Shutdown { response: oneshot::Sender<()> },
}

/// Actor that drains the outbox
struct NotifierActor {
    store: Arc<VoucherStore>,
    mailbox: mpsc::Receiver<NotifierMessage>,
    sinks: Vec<Arc<dyn SettlementSink>>,
    config: NotifierConfig,
    metrics: Metrics,
}

impl NotifierActor {
    async fn run(mut self) {
        let period = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let mut poll_timer = interval_at(Instant::now() + period, period);
        poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut stopped_by = None;

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => {
                    match msg {
                        Some(NotifierMessage::Wake) => self.drain_logged().await,
                        Some(NotifierMessage::Subscribe { sink, response }) => {
                            tracing::info!(sink = sink.name(), "Settlement sink subscribed");
                            self.sinks.push(sink);
                            let _ = response.send(());
                            self.drain_logged().await;
                        }
                        Some(NotifierMessage::Flush { response }) => {
                            let result = self.drain().await;
                            let _ = response.send(result);
                        }
                        Some(NotifierMessage::Shutdown { response }) => {
                            stopped_by = Some(response);
                            break;
                        }
                        // All handles dropped
                        None => break,
                    }
                }

                _ = poll_timer.tick() => self.drain_logged().await,
            }
        }

        // Release the store before acknowledging so the database can be reopened
        drop(self.store);
        drop(self.sinks);
        tracing::debug!("Notifier stopped");
        if let Some(response) = stopped_by {
            let _ = response.send(());
        }
    }

    async fn drain_logged(&mut self) {
        if let Err(e) = self.drain().await {
            tracing::warn!(error = %e, "Outbox delivery interrupted, will retry");
        }
    }

    /// Deliver pending entries until the outbox is empty or a sink fails
    async fn drain(&mut self) -> Result<usize> {
        // Without sinks, entries stay queued for the first subscriber
        if self.sinks.is_empty() {
            return Ok(0);
        }

        let mut delivered = 0;
        loop {
            let pending = self.store.storage().outbox_pending(self.config.max_batch)?;
            if pending.is_empty() {
                break;
            }
            let round = pending.len();

            for (seq, tx) in pending {
                self.deliver_to_all(&tx).await?;
                self.store.storage().outbox_ack(seq)?;
                self.metrics.record_delivery();
                delivered += 1;
            }

            if round < self.config.max_batch {
                break;
            }
        }

        if delivered > 0 {
            tracing::debug!(delivered, "Outbox drained");
        }
        self.metrics
            .update_outbox_pending(self.store.storage().outbox_pending(self.config.max_batch)?.len());
        Ok(delivered)
    }

    async fn deliver_to_all(&self, tx: &Transaction) -> Result<()> {
        let deadline = Duration::from_millis(self.config.delivery_timeout_ms);
        for sink in &self.sinks {
            match tokio::time::timeout(deadline, sink.deliver(tx)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        sink = sink.name(),
                        transaction_id = %tx.id,
                        error = %e,
                        "Sink rejected transaction"
                    );
                    return Err(Error::Delivery(format!("{}: {}", sink.name(), e)));
                }
                Err(_) => {
                    tracing::warn!(
                        sink = sink.name(),
                        transaction_id = %tx.id,
                        timeout_ms = self.config.delivery_timeout_ms,
                        "Sink delivery timed out"
                    );
                    return Err(Error::Delivery(format!("{}: timed out", sink.name())));
                }
            }
        }
        Ok(())
    }
}

/// Handle for sending messages to the notifier
#[derive(Clone)]
pub struct NotifierHandle {
    sender: mpsc::Sender<NotifierMessage>,
}

impl std::fmt::Debug for NotifierHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierHandle")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl NotifierHandle {
    /// Signal new outbox entries without waiting
    pub fn wake(&self) {
        // A full mailbox already holds a pending wake
        let _ = self.sender.try_send(NotifierMessage::Wake);
    }

    /// Register a sink; pending entries are delivered to it right away
    pub async fn subscribe(&self, sink: Arc<dyn SettlementSink>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(NotifierMessage::Subscribe { sink, response: tx })
            .await
            .map_err(|_| Error::Concurrency("Notifier mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Drain the outbox and report how many entries were delivered
    pub async fn flush(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(NotifierMessage::Flush { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Notifier mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Stop the actor
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(NotifierMessage::Shutdown { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Notifier mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }
}

/// Spawn the notifier actor
pub fn spawn_notifier(
    store: Arc<VoucherStore>,
    config: NotifierConfig,
    metrics: Metrics,
) -> NotifierHandle {
    // Bounded channel for backpressure
    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let actor = NotifierActor {
        store,
        mailbox: rx,
        sinks: Vec::new(),
        config,
        metrics,
    };

    tokio::spawn(async move {
        actor.run().await;
    });

    NotifierHandle { sender: tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::types::{TransactionId, TransactionStatus, VendorId, VoucherId, WalletId};
    use crate::Config;
    use chrono::Utc;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSink {
        seen: Mutex<Vec<TransactionId>>,
        failures_left: AtomicUsize,
    }

    impl RecordingSink {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                failures_left: AtomicUsize::new(failures),
            })
        }
    }

    #[async_trait]
    impl SettlementSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, tx: &Transaction) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Delivery("downstream unavailable".to_string()));
            }
            self.seen.lock().push(tx.id);
            Ok(())
        }
    }

    fn setup() -> (Arc<VoucherStore>, Config, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_root(temp_dir.path());
        config.notifier.poll_interval_ms = 60_000;
        let storage = Storage::open(&config).unwrap();
        let store = Arc::new(VoucherStore::new(storage, Duration::from_millis(100)));
        (store, config, temp_dir)
    }

    fn commit_tx(store: &VoucherStore, token: &str) -> TransactionId {
        let tx = Transaction {
            id: TransactionId::new(),
            wallet_id: WalletId::new(),
            voucher_id: VoucherId::new(),
            vendor_id: VendorId::new("V001"),
            vendor_name: "Agro Supplies".to_string(),
            amount: Decimal::new(100, 0),
            purpose: "Food Support".to_string(),
            status: TransactionStatus::Completed,
            idempotency_token: token.to_string(),
            created_at: Utc::now(),
            prev_hash: String::new(),
            hash: String::new(),
        };
        let mut batch = store.storage().batch();
        batch.put_transaction(&tx).unwrap();
        batch.commit().unwrap();
        tx.id
    }

    #[tokio::test]
    async fn test_delivers_in_commit_order() {
        let (store, config, _temp) = setup();
        let ids: Vec<_> = (0..5).map(|i| commit_tx(&store, &format!("t{}", i))).collect();

        let handle = spawn_notifier(store.clone(), config.notifier, Metrics::new().unwrap());
        let sink = RecordingSink::new(0);
        handle.subscribe(sink.clone()).await.unwrap();
        handle.flush().await.unwrap();

        assert_eq!(*sink.seen.lock(), ids);
        assert!(store.storage().outbox_pending(10).unwrap().is_empty());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_entries_wait_for_first_sink() {
        let (store, config, _temp) = setup();
        commit_tx(&store, "t0");

        let handle = spawn_notifier(store.clone(), config.notifier, Metrics::new().unwrap());
        assert_eq!(handle.flush().await.unwrap(), 0);
        assert_eq!(store.storage().outbox_pending(10).unwrap().len(), 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_redelivers_after_failure() {
        let (store, config, _temp) = setup();

        let handle = spawn_notifier(store.clone(), config.notifier, Metrics::new().unwrap());
        let sink = RecordingSink::new(1);
        handle.subscribe(sink.clone()).await.unwrap();

        let first = commit_tx(&store, "t0");
        let second = commit_tx(&store, "t1");

        assert!(matches!(handle.flush().await, Err(Error::Delivery(_))));
        assert!(sink.seen.lock().is_empty());
        assert_eq!(store.storage().outbox_pending(10).unwrap().len(), 2);

        assert_eq!(handle.flush().await.unwrap(), 2);
        assert_eq!(*sink.seen.lock(), vec![first, second]);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_wake_delivers_without_flush() {
        let (store, config, _temp) = setup();
        let handle = spawn_notifier(store.clone(), config.notifier, Metrics::new().unwrap());
        let sink = RecordingSink::new(0);
        handle.subscribe(sink.clone()).await.unwrap();

        let id = commit_tx(&store, "t0");
        handle.wake();

        for _ in 0..50 {
            if !sink.seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*sink.seen.lock(), vec![id]);
        handle.shutdown().await.unwrap();
    }
}
