//! Voucher Settlement
//!
//! Downstream consumers of committed ledger transactions. Both types here
//! implement [`voucher_ledger::SettlementSink`] and are registered with the
//! ledger's notifier; neither takes part in the payment commit.
//!
//! # Architecture
//!
//! - **Vendor settlement**: transactions collect in one window per vendor;
//!   due windows close into payout batches, all persisted in RocksDB
//! - **Push hub**: payments fan out to citizen, vendor and authority dashboards
//!   over a broadcast channel
//!
//! # Example
//!
//! ```no_run
//! use settlement::{Config, PushHub, VendorSettlementEngine};
//! use std::sync::Arc;
//!
//! # async fn run(ledger: voucher_ledger::LedgerEngine) -> settlement::Result<()> {
//! let config = Config::default();
//! let settlement = Arc::new(VendorSettlementEngine::open(config.clone())?);
//! let push = Arc::new(PushHub::new(config.push.capacity));
//!
//! ledger.subscribe(settlement.clone()).await?;
//! ledger.subscribe(push.clone()).await?;
//! let _scheduler = settlement.start_scheduler();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod engine;
pub mod error;
pub mod push;
pub mod store;
pub mod types;
pub mod window;

// Re-exports
pub use config::Config;
pub use engine::VendorSettlementEngine;
pub use error::{Error, Result};
pub use push::{PushHub, PushSubscription};
pub use store::SettlementStore;
pub use types::*;
