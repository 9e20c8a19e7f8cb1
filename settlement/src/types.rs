//! Core types for vendor settlement

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use voucher_ledger::{Transaction, TransactionId, VendorId, WalletId};

/// Settlement batch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    /// Window closed, payout computed
    Closed,
    /// Payout recorded
    Settled,
}

/// One vendor payout covering a closed settlement window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementBatch {
    /// Batch ID
    pub batch_id: Uuid,

    /// Paid vendor
    pub vendor_id: VendorId,

    /// Window start time
    pub window_start: DateTime<Utc>,

    /// Window end time (actual close time)
    pub window_end: DateTime<Utc>,

    /// Transactions included, in delivery order
    pub transaction_ids: Vec<TransactionId>,

    /// Number of transactions
    pub transaction_count: usize,

    /// Sum of transaction amounts owed to the vendor
    pub total_amount: Decimal,

    /// Status
    pub status: SettlementStatus,

    /// When the payout was recorded
    pub settled_at: Option<DateTime<Utc>>,
}

/// Vendor-facing view of an open window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSettlement {
    /// Vendor
    pub vendor_id: VendorId,

    /// Window start time
    pub window_start: DateTime<Utc>,

    /// Scheduled close time
    pub window_end: DateTime<Utc>,

    /// Transactions collected so far
    pub transaction_count: usize,

    /// Amount collected so far
    pub total_amount: Decimal,
}

/// Realtime payment event pushed to dashboards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentNotification {
    /// Transaction ID
    pub transaction_id: TransactionId,

    /// Paying wallet
    pub wallet_id: WalletId,

    /// Receiving vendor
    pub vendor_id: VendorId,

    /// Vendor display name
    pub vendor_name: String,

    /// Amount paid
    pub amount: Decimal,

    /// Voucher purpose
    pub purpose: String,

    /// Commit time
    pub created_at: DateTime<Utc>,
}

impl From<&Transaction> for PaymentNotification {
    fn from(tx: &Transaction) -> Self {
        Self {
            transaction_id: tx.id,
            wallet_id: tx.wallet_id,
            vendor_id: tx.vendor_id.clone(),
            vendor_name: tx.vendor_name.clone(),
            amount: tx.amount,
            purpose: tx.purpose.clone(),
            created_at: tx.created_at,
        }
    }
}

/// Which payment events a dashboard receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFilter {
    /// Every payment (authority realtime tracking)
    All,
    /// Payments from one wallet (citizen view)
    Wallet(WalletId),
    /// Payments to one vendor (vendor feed)
    Vendor(VendorId),
}

impl PushFilter {
    /// Check if the event belongs to this subscription
    pub fn matches(&self, event: &PaymentNotification) -> bool {
        match self {
            PushFilter::All => true,
            PushFilter::Wallet(wallet_id) => event.wallet_id == *wallet_id,
            PushFilter::Vendor(vendor_id) => event.vendor_id == *vendor_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voucher_ledger::{TransactionStatus, VoucherId};

    fn notification() -> PaymentNotification {
        let tx = Transaction {
            id: TransactionId::new(),
            wallet_id: WalletId::new(),
            voucher_id: VoucherId::new(),
            vendor_id: VendorId::new("V001"),
            vendor_name: "Green Valley Agro".to_string(),
            amount: Decimal::new(450, 0),
            purpose: "Fertilizer Subsidy".to_string(),
            status: TransactionStatus::Completed,
            idempotency_token: "tok".to_string(),
            created_at: Utc::now(),
            prev_hash: String::new(),
            hash: String::new(),
        };
        PaymentNotification::from(&tx)
    }

    #[test]
    fn test_notification_uses_camel_case() {
        let json = serde_json::to_value(notification()).unwrap();
        assert!(json.get("transactionId").is_some());
        assert!(json.get("vendorName").is_some());
        assert!(json.get("idempotencyToken").is_none());
    }

    #[test]
    fn test_push_filter() {
        let event = notification();
        assert!(PushFilter::All.matches(&event));
        assert!(PushFilter::Vendor(VendorId::new("V001")).matches(&event));
        assert!(!PushFilter::Vendor(VendorId::new("V002")).matches(&event));
        assert!(PushFilter::Wallet(event.wallet_id).matches(&event));
        assert!(!PushFilter::Wallet(WalletId::new()).matches(&event));
    }
}
