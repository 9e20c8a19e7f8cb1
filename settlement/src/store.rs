//! Settlement persistence using RocksDB
//!
//! # Column Families
//!
//! - `windows` - Open window headers (key: vendor_id)
//! - `window_entries` - Transactions in open windows (key: vendor_id | position)
//! - `seen` - Every windowed transaction id (value: empty while open, batch id once paid)
//! - `batches` - Payout batches (key: batch_id, UUIDv7 so time-ordered)
//!
//! Recording a delivery and recording a payout each commit as one `WriteBatch`.

use crate::{
    config::Config,
    types::SettlementBatch,
    window::SettlementWindow,
    Error, Result,
};
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use voucher_ledger::{TransactionId, VendorId};

const CF_WINDOWS: &str = "windows";
const CF_WINDOW_ENTRIES: &str = "window_entries";
const CF_SEEN: &str = "seen";
const CF_BATCHES: &str = "batches";

const ALL_CFS: [&str; 4] = [CF_WINDOWS, CF_WINDOW_ENTRIES, CF_SEEN, CF_BATCHES];

/// Window fields minus its transaction list
#[derive(Debug, Serialize, Deserialize)]
struct WindowHeader {
    window_id: Uuid,
    vendor_id: VendorId,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    transaction_count: u64,
    total_amount: Decimal,
}

impl From<&SettlementWindow> for WindowHeader {
    fn from(window: &SettlementWindow) -> Self {
        Self {
            window_id: window.window_id,
            vendor_id: window.vendor_id.clone(),
            start_time: window.start_time,
            end_time: window.end_time,
            transaction_count: window.transaction_ids.len() as u64,
            total_amount: window.total_amount,
        }
    }
}

/// Durable settlement state
pub struct SettlementStore {
    db: DB,
    sync_writes: bool,
}

impl std::fmt::Debug for SettlementStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementStore")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl SettlementStore {
    /// Open or create the settlement database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors = ALL_CFS
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        tracing::info!(path = ?path, "Opened settlement store");

        Ok(Self {
            db,
            sync_writes: config.sync_writes,
        })
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn entry_key(vendor_id: &VendorId, position: u64) -> Vec<u8> {
        let mut key = Self::entry_prefix(vendor_id);
        key.extend_from_slice(&position.to_be_bytes());
        key
    }

    // Vendor ids never contain '|'
    fn entry_prefix(vendor_id: &VendorId) -> Vec<u8> {
        let mut key = vendor_id.as_str().as_bytes().to_vec();
        key.push(b'|');
        key
    }

    /// Whether a transaction was already windowed or paid out
    pub fn is_seen(&self, tx_id: TransactionId) -> Result<bool> {
        let cf = self.cf_handle(CF_SEEN)?;
        Ok(self.db.get_pinned_cf(cf, tx_id.as_bytes())?.is_some())
    }

    /// Batch that paid out a transaction
    pub fn paid_in(&self, tx_id: TransactionId) -> Result<Option<Uuid>> {
        let cf = self.cf_handle(CF_SEEN)?;
        match self.db.get_cf(cf, tx_id.as_bytes())? {
            Some(bytes) if bytes.len() == 16 => {
                let mut id = [0u8; 16];
                id.copy_from_slice(&bytes);
                Ok(Some(Uuid::from_bytes(id)))
            }
            _ => Ok(None),
        }
    }

    /// Persist the newest transaction of `window` together with its header
    pub fn record(&self, window: &SettlementWindow) -> Result<()> {
        let tx_id = window
            .transaction_ids
            .last()
            .ok_or_else(|| Error::Storage("Recording an empty window".to_string()))?;
        let position = window.transaction_ids.len() as u64 - 1;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf_handle(CF_WINDOWS)?,
            window.vendor_id.as_str().as_bytes(),
            bincode::serialize(&WindowHeader::from(window))?,
        );
        batch.put_cf(
            self.cf_handle(CF_WINDOW_ENTRIES)?,
            Self::entry_key(&window.vendor_id, position),
            tx_id.as_bytes(),
        );
        batch.put_cf(self.cf_handle(CF_SEEN)?, tx_id.as_bytes(), b"");
        self.write(batch)
    }

    /// Rewrite window headers (carried-over end times)
    pub fn update_headers<'a>(&self, windows: impl IntoIterator<Item = &'a SettlementWindow>) -> Result<()> {
        let cf = self.cf_handle(CF_WINDOWS)?;
        let mut batch = WriteBatch::default();
        for window in windows {
            batch.put_cf(
                cf,
                window.vendor_id.as_str().as_bytes(),
                bincode::serialize(&WindowHeader::from(window))?,
            );
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.write(batch)
    }

    /// Drop a closed window and store its payout
    pub fn settle(&self, window: &SettlementWindow, payout: &SettlementBatch) -> Result<()> {
        let entries = self.cf_handle(CF_WINDOW_ENTRIES)?;
        let seen = self.cf_handle(CF_SEEN)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf_handle(CF_WINDOWS)?, window.vendor_id.as_str().as_bytes());
        for (position, tx_id) in window.transaction_ids.iter().enumerate() {
            batch.delete_cf(entries, Self::entry_key(&window.vendor_id, position as u64));
            batch.put_cf(seen, tx_id.as_bytes(), payout.batch_id.as_bytes());
        }
        batch.put_cf(
            self.cf_handle(CF_BATCHES)?,
            payout.batch_id.as_bytes(),
            bincode::serialize(payout)?,
        );
        self.write(batch)
    }

    /// Open windows as last persisted
    pub fn load_windows(&self) -> Result<Vec<SettlementWindow>> {
        let headers = self.cf_handle(CF_WINDOWS)?;
        let entries = self.cf_handle(CF_WINDOW_ENTRIES)?;
        let mut windows = Vec::new();

        for item in self.db.iterator_cf(headers, IteratorMode::Start) {
            let (_, value) = item?;
            let header: WindowHeader = bincode::deserialize(&value)?;

            let prefix = Self::entry_prefix(&header.vendor_id);
            let mut transaction_ids = Vec::with_capacity(header.transaction_count as usize);
            for item in self
                .db
                .iterator_cf(entries, IteratorMode::From(&prefix, Direction::Forward))
            {
                let (key, value) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                let bytes: [u8; 16] = value[..]
                    .try_into()
                    .map_err(|_| Error::Storage("Malformed window entry".to_string()))?;
                transaction_ids.push(TransactionId::from_uuid(Uuid::from_bytes(bytes)));
            }

            if transaction_ids.len() as u64 != header.transaction_count {
                return Err(Error::Storage(format!(
                    "Window {} lists {} transactions, header says {}",
                    header.window_id,
                    transaction_ids.len(),
                    header.transaction_count
                )));
            }

            windows.push(SettlementWindow {
                window_id: header.window_id,
                vendor_id: header.vendor_id,
                start_time: header.start_time,
                end_time: header.end_time,
                transaction_ids,
                total_amount: header.total_amount,
            });
        }

        Ok(windows)
    }

    /// Payout batches, oldest first
    pub fn batches(&self, vendor_id: Option<&VendorId>) -> Result<Vec<SettlementBatch>> {
        let cf = self.cf_handle(CF_BATCHES)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let batch: SettlementBatch = bincode::deserialize(&value)?;
            if vendor_id.map_or(true, |id| batch.vendor_id == *id) {
                out.push(batch);
            }
        }
        Ok(out)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}
