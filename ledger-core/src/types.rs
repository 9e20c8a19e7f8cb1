//! Core types for the voucher ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Memory safety (no unsafe code)
//! - Exact arithmetic (Decimal for money)

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new time-ordered (UUIDv7) identifier
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap an existing UUID
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Underlying UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Raw bytes (used for storage keys)
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Beneficiary wallet identifier
    WalletId
);
uuid_id!(
    /// Voucher identifier
    VoucherId
);
uuid_id!(
    /// Subsidy programme identifier
    SubsidyId
);
uuid_id!(
    /// Transaction identifier
    TransactionId
);

/// Vendor identifier, assigned by the external vendor registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VendorId(String);

impl VendorId {
    /// Create new vendor ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VendorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Beneficiary wallet
///
/// Holds no balance field: the available balance is always derived from the
/// wallet's active vouchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet ID
    pub id: WalletId,

    /// Reference to the beneficiary in the identity system
    pub holder_ref: String,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

/// Voucher status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoucherStatus {
    /// Spendable
    Active,
    /// Consumed by a payment (terminal)
    Used,
    /// No longer spendable (terminal)
    Expired,
}

/// Purpose-bound unit of spendable subsidy value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    /// Voucher ID
    pub id: VoucherId,

    /// Owning wallet
    pub wallet_id: WalletId,

    /// Subsidy that issued this voucher
    pub subsidy_id: SubsidyId,

    /// Spendable amount (never negative)
    pub amount: Decimal,

    /// Purpose tag (subsidy type)
    pub purpose: String,

    /// Current status
    pub status: VoucherStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl Voucher {
    /// Check if voucher can fund payments
    pub fn is_active(&self) -> bool {
        self.status == VoucherStatus::Active
    }

    /// Consume the voucher
    pub fn into_used(mut self) -> Self {
        self.status = VoucherStatus::Used;
        self
    }
}

/// Subsidy status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubsidyStatus {
    /// Programme running
    Active,
    /// Programme closed
    Closed,
}

/// Subsidy issuance event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subsidy {
    /// Subsidy ID
    pub id: SubsidyId,

    /// Subsidy type (e.g. "Food Support")
    pub name: String,

    /// Purpose description
    pub purpose: String,

    /// Amount credited to each beneficiary
    pub amount_per_beneficiary: Decimal,

    /// Number of vouchers issued
    pub beneficiary_count: u64,

    /// Running total of value disbursed
    pub total_disbursed: Decimal,

    /// Current status
    pub status: SubsidyStatus,

    /// Actor that issued the subsidy
    pub issued_by: String,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Optimistic concurrency version, bumped on every update
    pub version: u64,
}

/// Registered vendor (payee)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vendor {
    /// Vendor ID
    pub vendor_id: VendorId,

    /// Globally unique QR code payload
    pub qr_code: String,

    /// Display name
    pub vendor_name: String,

    /// Business type (e.g. "Agro Supplies")
    pub business_type: String,

    /// Inactive vendors reject all payments
    pub is_active: bool,
}

/// Transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// Not yet committed
    Pending,
    /// Committed (immutable)
    Completed,
    /// Failed
    Failed,
}

/// Immutable record of one completed payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction ID
    pub id: TransactionId,

    /// Paying wallet
    pub wallet_id: WalletId,

    /// Voucher that funded the payment
    pub voucher_id: VoucherId,

    /// Receiving vendor
    pub vendor_id: VendorId,

    /// Vendor display name at payment time
    pub vendor_name: String,

    /// Payment amount
    pub amount: Decimal,

    /// Voucher purpose tag
    pub purpose: String,

    /// Status
    pub status: TransactionStatus,

    /// Client-supplied idempotency token
    pub idempotency_token: String,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Audit chain hash preceding this transaction's entry
    pub prev_hash: String,

    /// Audit chain hash of this transaction's entry
    pub hash: String,
}

/// Caller role, established by the external identity provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Beneficiary bound to exactly one wallet
    Beneficiary {
        /// Wallet the session may spend from
        wallet_id: WalletId,
    },
    /// Issuing authority (subsidies, onboarding, vendor registry)
    Authority,
    /// Ledger operator (audit remediation)
    Operator,
}

/// Authenticated caller passed into every engine call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Actor identifier recorded in the audit trail
    pub actor_id: String,

    /// Role granted by the session
    pub role: Role,
}

impl Principal {
    /// Beneficiary session bound to a wallet
    pub fn beneficiary(actor_id: impl Into<String>, wallet_id: WalletId) -> Self {
        Self {
            actor_id: actor_id.into(),
            role: Role::Beneficiary { wallet_id },
        }
    }

    /// Issuing authority session
    pub fn authority(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            role: Role::Authority,
        }
    }

    /// Operator session
    pub fn operator(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            role: Role::Operator,
        }
    }

    /// Check if the session may spend from the wallet
    pub fn can_spend_from(&self, wallet_id: WalletId) -> bool {
        matches!(self.role, Role::Beneficiary { wallet_id: bound } if bound == wallet_id)
    }
}

/// Payment request from a beneficiary session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Paying wallet
    pub wallet_id: WalletId,

    /// Decoded vendor QR payload
    pub vendor_qr_code: String,

    /// Amount to pay (> 0)
    pub amount: Decimal,

    /// Client-supplied idempotency token
    pub idempotency_token: String,
}

/// Subsidy issuance request from the authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceRequest {
    /// Subsidy type (e.g. "Fertilizer Subsidy")
    pub subsidy_type: String,

    /// Amount credited per wallet (> 0)
    pub amount_per_beneficiary: Decimal,

    /// Purpose description
    pub purpose: String,

    /// Client-supplied issuance token
    pub issuance_token: String,
}

/// Vendor registry record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorRegistration {
    /// Vendor ID
    pub vendor_id: VendorId,

    /// QR code payload (globally unique)
    pub qr_code: String,

    /// Display name
    pub vendor_name: String,

    /// Business type
    pub business_type: String,

    /// Active flag
    pub is_active: bool,
}

impl From<VendorRegistration> for Vendor {
    fn from(reg: VendorRegistration) -> Self {
        Self {
            vendor_id: reg.vendor_id,
            qr_code: reg.qr_code,
            vendor_name: reg.vendor_name,
            business_type: reg.business_type,
            is_active: reg.is_active,
        }
    }
}

/// Wallet with its derived balance
#[derive(Debug, Clone)]
pub struct WalletSummary {
    /// Wallet record
    pub wallet: Wallet,

    /// Active vouchers, oldest first
    pub active_vouchers: Vec<Voucher>,

    /// Sum of active voucher amounts
    pub available_balance: Decimal,
}

/// Authority dashboard figures
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisbursementSummary {
    /// Sum of all subsidies' disbursed value
    pub total_disbursed: Decimal,

    /// Sum of all subsidies' beneficiary counts
    pub total_beneficiaries: u64,

    /// Number of completed transactions
    pub transaction_count: u64,

    /// Sum of completed transaction amounts
    pub total_redeemed: Decimal,

    /// Number of active subsidy programmes
    pub active_programs: u64,
}

/// Add two amounts, failing with [`Error::AmountOverflow`] past the decimal range
pub fn checked_add(total: Decimal, amount: Decimal, what: &str) -> Result<Decimal> {
    total
        .checked_add(amount)
        .ok_or_else(|| Error::AmountOverflow(format!("{} exceeds {}", what, Decimal::MAX)))
}

/// Sum of active voucher amounts
pub fn active_balance<'a>(vouchers: impl IntoIterator<Item = &'a Voucher>) -> Result<Decimal> {
    vouchers
        .into_iter()
        .filter(|v| v.is_active())
        .try_fold(Decimal::ZERO, |total, v| checked_add(total, v.amount, "Wallet balance"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voucher(amount: i64, status: VoucherStatus) -> Voucher {
        Voucher {
            id: VoucherId::new(),
            wallet_id: WalletId::new(),
            subsidy_id: SubsidyId::new(),
            amount: Decimal::new(amount, 0),
            purpose: "Food Support".to_string(),
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_active_balance_ignores_used_and_expired() {
        let vouchers = vec![
            voucher(500, VoucherStatus::Active),
            voucher(300, VoucherStatus::Used),
            voucher(200, VoucherStatus::Expired),
            voucher(100, VoucherStatus::Active),
        ];

        assert_eq!(active_balance(&vouchers).unwrap(), Decimal::new(600, 0));
    }

    #[test]
    fn test_active_balance_overflow_is_an_error() {
        let huge = Decimal::from_i128_with_scale(5 * 10i128.pow(28), 0);
        let mut vouchers = vec![voucher(1, VoucherStatus::Active), voucher(1, VoucherStatus::Active)];
        for v in &mut vouchers {
            v.amount = huge;
        }

        assert!(matches!(active_balance(&vouchers), Err(Error::AmountOverflow(_))));

        vouchers[1].status = VoucherStatus::Used;
        assert_eq!(active_balance(&vouchers).unwrap(), huge);
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let first = TransactionId::new();
        let second = TransactionId::new();
        assert_eq!(first.as_uuid().get_version_num(), 7);
        assert_ne!(first, second);
    }

    #[test]
    fn test_principal_wallet_binding() {
        let wallet = WalletId::new();
        let session = Principal::beneficiary("citizen-1", wallet);
        assert!(session.can_spend_from(wallet));
        assert!(!session.can_spend_from(WalletId::new()));
        assert!(!Principal::authority("officer-1").can_spend_from(wallet));
    }

    #[test]
    fn test_voucher_into_used() {
        let v = voucher(500, VoucherStatus::Active);
        let used = v.clone().into_used();
        assert_eq!(used.status, VoucherStatus::Used);
        assert_eq!(used.amount, v.amount);
        assert!(!used.is_active());
    }
}
