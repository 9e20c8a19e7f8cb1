//! Voucher Ledger
//!
//! Purpose-bound subsidy ledger: an issuing authority credits vouchers to
//! beneficiary wallets, beneficiaries redeem them at registered vendors, and
//! every mutation is sealed into a tamper-evident audit chain.
//!
//! # Architecture
//!
//! - **Per-entity locking**: one async mutex per wallet or subsidy; no global entity lock
//! - **Single WriteBatch commits**: voucher state, transaction, idempotency token
//!   and outbox entry land atomically
//! - **Hash-chained audit log**: SHA-256 chain in a JSON-lines file, written
//!   before the state it describes
//! - **Outbox notifier**: committed transactions reach settlement sinks
//!   asynchronously, at-least-once, in commit order
//!
//! # Invariants
//!
//! - A wallet's balance is the sum of its active vouchers; it is never stored
//! - A voucher goes active → used at most once
//! - Every completed transaction references one voucher that was active at debit time
//! - The audit chain is append-only

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod metrics;
pub mod notifier;
pub mod retry;
pub mod storage;
pub mod store;
pub mod types;

// Re-exports
pub use audit::{AuditAction, AuditAnchor, AuditEntry, AuditFilter, AuditLog};
pub use config::{Config, PartialUsePolicy};
pub use engine::LedgerEngine;
pub use error::{Error, Result};
pub use notifier::{NotifierHandle, SettlementSink};
pub use storage::Storage;
pub use types::{
    DisbursementSummary, IssuanceRequest, PaymentRequest, Principal, Role, Subsidy, SubsidyId,
    SubsidyStatus, Transaction, TransactionId, TransactionStatus, Vendor, VendorId,
    VendorRegistration, Voucher, VoucherId, VoucherStatus, Wallet, WalletId, WalletSummary,
};
