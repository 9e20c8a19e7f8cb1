//! Ledger → notifier → settlement integration tests

use async_trait::async_trait;
use chrono::{Duration, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use settlement::{Config, PushFilter, PushHub, VendorSettlementEngine};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use voucher_ledger::{
    IssuanceRequest, LedgerEngine, PaymentRequest, Principal, SettlementSink, Transaction,
    TransactionId, TransactionStatus, VendorId, VendorRegistration, VoucherId, WalletId,
};

async fn open_ledger(root: &std::path::Path) -> (LedgerEngine, Vec<WalletId>) {
    let mut config = voucher_ledger::Config::with_root(root);
    config.notifier.poll_interval_ms = 60_000;
    let ledger = LedgerEngine::open(config).await.unwrap();
    let authority = Principal::authority("officer-1");

    for (id, qr) in [("V001", "QR-V001"), ("V002", "QR-V002")] {
        ledger
            .register_vendor(
                &authority,
                VendorRegistration {
                    vendor_id: VendorId::new(id),
                    qr_code: qr.to_string(),
                    vendor_name: format!("Vendor {}", id),
                    business_type: "Agro Supplies".to_string(),
                    is_active: true,
                },
            )
            .await
            .unwrap();
    }

    let mut wallets = Vec::new();
    for holder in ["C001", "C002"] {
        wallets.push(ledger.open_wallet(&authority, holder).await.unwrap().id);
    }

    ledger
        .issue_subsidy(
            &authority,
            IssuanceRequest {
                subsidy_type: "Food Support".to_string(),
                amount_per_beneficiary: Decimal::new(1_000, 0),
                purpose: "Monthly food basket".to_string(),
                issuance_token: "issue-1".to_string(),
            },
        )
        .await
        .unwrap();

    (ledger, wallets)
}

async fn pay(ledger: &LedgerEngine, wallet_id: WalletId, qr: &str, amount: i64, token: &str) -> Transaction {
    ledger
        .process_payment(
            &Principal::beneficiary("citizen", wallet_id),
            PaymentRequest {
                wallet_id,
                vendor_qr_code: qr.to_string(),
                amount: Decimal::new(amount, 0),
                idempotency_token: token.to_string(),
            },
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn payments_flow_into_vendor_windows_and_dashboards() {
    let temp = tempfile::tempdir().unwrap();
    let (ledger, wallets) = open_ledger(temp.path()).await;

    let config = Config::with_root(temp.path());
    let settlement = Arc::new(VendorSettlementEngine::open(config.clone()).unwrap());
    let push = Arc::new(PushHub::new(config.push.capacity));
    let mut vendor_feed = push.subscribe(PushFilter::Vendor(VendorId::new("V001")));
    let mut citizen_feed = push.subscribe(PushFilter::Wallet(wallets[1]));

    ledger.subscribe(settlement.clone()).await.unwrap();
    ledger.subscribe(push.clone()).await.unwrap();

    let first = pay(&ledger, wallets[0], "QR-V001", 300, "a").await;
    let second = pay(&ledger, wallets[1], "QR-V002", 200, "b").await;
    let third = pay(&ledger, wallets[0], "QR-V001", 100, "c").await;
    ledger.notifier().flush().await.unwrap();

    let pending = settlement.pending(&VendorId::new("V001")).await.unwrap();
    assert_eq!(pending.transaction_count, 2);
    assert_eq!(pending.total_amount, Decimal::new(400, 0));

    assert_eq!(vendor_feed.recv().await.unwrap().transaction_id, first.id);
    assert_eq!(vendor_feed.recv().await.unwrap().transaction_id, third.id);
    assert_eq!(citizen_feed.recv().await.unwrap().transaction_id, second.id);

    let later = Utc::now() + Duration::seconds(config.window.duration_seconds as i64 + 1);
    let batches = settlement.settle_due(later).await.unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].transaction_ids, vec![first.id, third.id]);

    let paid_out: Decimal = batches.iter().map(|b| b.total_amount).sum();
    assert_eq!(paid_out, ledger.disbursement_summary().unwrap().total_redeemed);

    ledger.shutdown().await.unwrap();
}

struct FlakySink {
    failures_left: AtomicUsize,
}

#[async_trait]
impl SettlementSink for FlakySink {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn deliver(&self, _tx: &Transaction) -> voucher_ledger::Result<()> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(voucher_ledger::Error::Delivery("bank gateway down".to_string()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn redelivery_is_settled_once() {
    let temp = tempfile::tempdir().unwrap();
    let (ledger, wallets) = open_ledger(temp.path()).await;

    let settlement = Arc::new(VendorSettlementEngine::open(Config::with_root(temp.path())).unwrap());
    ledger.subscribe(settlement.clone()).await.unwrap();
    ledger
        .subscribe(Arc::new(FlakySink {
            failures_left: AtomicUsize::new(2),
        }))
        .await
        .unwrap();

    let tx = pay(&ledger, wallets[0], "QR-V001", 250, "a").await;

    // Settlement sees the transaction on every attempt, the flaky sink rejects twice
    let mut attempts = 0;
    while ledger.notifier().flush().await.is_err() {
        attempts += 1;
        assert!(attempts < 5);
    }
    assert_eq!(ledger.notifier().flush().await.unwrap(), 0);

    let batch = settlement.settle_vendor(&VendorId::new("V001")).await.unwrap();
    assert_eq!(batch.transaction_ids, vec![tx.id]);
    assert_eq!(batch.total_amount, Decimal::new(250, 0));

    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn payouts_survive_settlement_restart() {
    let temp = tempfile::tempdir().unwrap();
    let (ledger, wallets) = open_ledger(temp.path()).await;
    let first = pay(&ledger, wallets[0], "QR-V001", 300, "a").await;
    let second = pay(&ledger, wallets[1], "QR-V001", 120, "b").await;

    let batch = {
        let settlement = VendorSettlementEngine::open(Config::with_root(temp.path())).unwrap();
        settlement.deliver(&first).await.unwrap();
        let batch = settlement.settle_vendor(&VendorId::new("V001")).await.unwrap();
        settlement.deliver(&second).await.unwrap();
        batch
    };

    let settlement = VendorSettlementEngine::open(Config::with_root(temp.path())).unwrap();
    assert_eq!(settlement.history(None).unwrap(), vec![batch]);
    let pending = settlement.pending(&VendorId::new("V001")).await.unwrap();
    assert_eq!(pending.transaction_count, 1);

    // Both transactions redelivered after the restart: neither is counted again
    settlement.deliver(&first).await.unwrap();
    settlement.deliver(&second).await.unwrap();
    let batch = settlement.settle_vendor(&VendorId::new("V001")).await.unwrap();
    assert_eq!(batch.transaction_ids, vec![second.id]);
    assert_eq!(batch.total_amount, Decimal::new(120, 0));

    ledger.shutdown().await.unwrap();
}

fn transaction(vendor: usize, amount: i64) -> Transaction {
    Transaction {
        id: TransactionId::new(),
        wallet_id: WalletId::new(),
        voucher_id: VoucherId::new(),
        vendor_id: VendorId::new(format!("V{:03}", vendor)),
        vendor_name: "Vendor".to_string(),
        amount: Decimal::new(amount, 0),
        purpose: "Food Support".to_string(),
        status: TransactionStatus::Completed,
        idempotency_token: "tok".to_string(),
        created_at: Utc::now(),
        prev_hash: String::new(),
        hash: String::new(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: payouts equal the sum of distinct delivered transactions
    #[test]
    fn prop_duplicate_deliveries_never_double_pay(
        pool in prop::collection::vec((0usize..3, 1i64..1_000), 1..20),
        deliveries in prop::collection::vec(any::<prop::sample::Index>(), 1..60),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let txs: Vec<_> = pool.iter().map(|(v, a)| transaction(*v, *a)).collect();
            let temp = tempfile::tempdir().unwrap();
            let engine = VendorSettlementEngine::open(Config::with_root(temp.path())).unwrap();

            let mut delivered = std::collections::HashSet::new();
            for index in &deliveries {
                let tx = &txs[index.index(txs.len())];
                engine.deliver(tx).await.unwrap();
                delivered.insert(tx.id);
            }

            let expected: Decimal = txs
                .iter()
                .filter(|tx| delivered.contains(&tx.id))
                .map(|tx| tx.amount)
                .sum();

            let later = Utc::now() + Duration::days(2);
            let batches = engine.settle_due(later).await.unwrap();
            let paid: Decimal = batches.iter().map(|b| b.total_amount).sum();
            let count: usize = batches.iter().map(|b| b.transaction_count).sum();

            prop_assert_eq!(paid, expected);
            prop_assert_eq!(count, delivered.len());
            Ok::<(), TestCaseError>(())
        })?;
    }
}
