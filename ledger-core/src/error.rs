//! Error types for the voucher ledger

use crate::types::{SubsidyId, TransactionId, VendorId, WalletId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Vendor missing or inactive
    #[error("Vendor unavailable: {0}")]
    VendorUnavailable(String),

    /// Wallet not found
    #[error("Wallet not found: {0}")]
    WalletNotFound(WalletId),

    /// Requested amount exceeds the wallet's available balance
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Requested amount
        requested: Decimal,
        /// Current available balance
        available: Decimal,
    },

    /// No single active voucher covers the amount
    #[error("No single voucher covers {requested} (largest active voucher: {largest})")]
    NoSingleVoucherCovers {
        /// Requested amount
        requested: Decimal,
        /// Largest active voucher amount
        largest: Decimal,
    },

    /// Decimal arithmetic would leave the representable range
    #[error("Amount overflow: {0}")]
    AmountOverflow(String),

    /// Idempotency token already committed for a different request
    #[error("Idempotency token {token} already used by transaction {transaction_id}")]
    DuplicatePayment {
        /// Reused token
        token: String,
        /// Transaction that committed the token
        transaction_id: TransactionId,
    },

    /// Optimistic concurrency collision
    #[error("Persistence conflict: {0}")]
    PersistenceConflict(String),

    /// Audit chain verification failed
    #[error("Audit chain broken at entry {index}")]
    AuditChainBroken {
        /// Zero-based index of the first broken entry
        index: u64,
    },

    /// Commits refused until operator remediation
    #[error("Ledger halted: {0}")]
    LedgerHalted(String),

    /// Lock or write deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Session not allowed to perform the operation
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Subsidy not found
    #[error("Subsidy not found: {0}")]
    SubsidyNotFound(SubsidyId),

    /// Vendor not found
    #[error("Vendor not found: {0}")]
    VendorNotFound(VendorId),

    /// Settlement sink failed to accept a transaction
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON error (audit log lines)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Optimistic-lock collisions are retried inside the engine
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::PersistenceConflict(_))
    }

    /// Failures a caller may retry later with the same idempotency token
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::PersistenceConflict(_) | Error::Timeout(_) | Error::Storage(_) | Error::Io(_)
        )
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::VendorUnavailable(_) => "vendor_unavailable",
            Error::WalletNotFound(_) => "wallet_not_found",
            Error::InsufficientBalance { .. } => "insufficient_balance",
            Error::NoSingleVoucherCovers { .. } => "no_single_voucher_covers",
            Error::AmountOverflow(_) => "amount_overflow",
            Error::DuplicatePayment { .. } => "duplicate_payment",
            Error::PersistenceConflict(_) => "persistence_conflict",
            Error::AuditChainBroken { .. } => "audit_chain_broken",
            Error::LedgerHalted(_) => "ledger_halted",
            Error::Timeout(_) => "timeout",
            Error::Unauthorized(_) => "unauthorized",
            Error::InvalidRequest(_) => "invalid_request",
            Error::SubsidyNotFound(_) => "subsidy_not_found",
            Error::VendorNotFound(_) => "vendor_not_found",
            Error::Delivery(_) => "delivery",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Json(_) => "json",
            Error::Concurrency(_) => "concurrency",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(Error::PersistenceConflict("voucher changed".into()).is_retryable());
        assert!(!Error::Timeout("wallet lock".into()).is_retryable());
        assert!(!Error::InsufficientBalance {
            requested: Decimal::new(300, 0),
            available: Decimal::ZERO,
        }
        .is_retryable());
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout("wallet lock".into()).is_transient());
        assert!(!Error::WalletNotFound(WalletId::new()).is_transient());
        assert!(!Error::AuditChainBroken { index: 3 }.is_transient());
    }

    #[test]
    fn test_insufficient_balance_reports_available() {
        let err = Error::InsufficientBalance {
            requested: Decimal::new(300, 0),
            available: Decimal::new(120, 0),
        };
        assert!(err.to_string().contains("available 120"));
    }
}
