//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `wallets` - Wallet records (key: wallet_id)
//! - `vouchers` - Voucher records (key: voucher_id)
//! - `subsidies` - Subsidy records (key: subsidy_id)
//! - `vendors` - Vendor records (key: vendor_id)
//! - `transactions` - Completed transactions (key: transaction_id, UUIDv7 so time-ordered)
//! - `indices` - Secondary indices, idempotency tokens and the audit anchor
//! - `outbox` - Committed transactions awaiting notification (key: sequence)
//!
//! Every multi-record mutation goes through [`StorageBatch`], which commits as a
//! single RocksDB `WriteBatch`.

use crate::{
    audit::AuditAnchor,
    error::{Error, Result},
    types::{
        Subsidy, SubsidyId, Transaction, TransactionId, Vendor, VendorId, Voucher, VoucherId,
        Wallet, WalletId,
    },
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, WriteOptions, DB,
};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};

/// Column family names
const CF_WALLETS: &str = "wallets";
const CF_VOUCHERS: &str = "vouchers";
const CF_SUBSIDIES: &str = "subsidies";
const CF_VENDORS: &str = "vendors";
const CF_TRANSACTIONS: &str = "transactions";
const CF_INDICES: &str = "indices";
const CF_OUTBOX: &str = "outbox";

const ALL_CFS: [&str; 7] = [
    CF_WALLETS,
    CF_VOUCHERS,
    CF_SUBSIDIES,
    CF_VENDORS,
    CF_TRANSACTIONS,
    CF_INDICES,
    CF_OUTBOX,
];

/// Index key tags
const IDX_WALLET_VOUCHER: u8 = b'w';
const IDX_WALLET_TX: u8 = b't';
const IDX_VENDOR_TX: u8 = b'v';
const IDX_VENDOR_QR: u8 = b'q';
const IDX_PAYMENT_TOKEN: u8 = b'p';
const IDX_ISSUANCE_TOKEN: u8 = b'i';
const IDX_AUDIT_ANCHOR: u8 = b'a';

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
    sync_writes: bool,
    next_outbox_seq: AtomicU64,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Level);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let storage = Self {
            db,
            sync_writes: config.rocksdb.sync_writes,
            next_outbox_seq: AtomicU64::new(0),
        };

        // Resume outbox sequence after the last pending entry
        let next_seq = storage
            .last_outbox_seq()?
            .map(|seq| seq + 1)
            .unwrap_or(0);
        storage.next_outbox_seq.store(next_seq, Ordering::SeqCst);

        tracing::info!(
            path = ?path,
            column_families = ALL_CFS.len(),
            next_outbox_seq = next_seq,
            "Opened RocksDB"
        );

        Ok(storage)
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            CF_INDICES => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                // Point lookups for tokens and QR codes
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            CF_TRANSACTIONS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get_value<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn values<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let cf = self.cf_handle(cf)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    /// Keys under `prefix` in the index CF, ascending
    fn index_scan(&self, prefix: &[u8]) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let mut keys = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// Keys under `prefix` in the index CF, descending, at most `limit`
    fn index_scan_rev(&self, prefix: &[u8], limit: usize) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let mut upper = prefix.to_vec();
        upper.extend_from_slice(&[0xff; 17]);

        let mut keys = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&upper, Direction::Reverse))
        {
            if keys.len() >= limit {
                break;
            }
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn trailing_uuid(key: &[u8]) -> Result<uuid::Uuid> {
        if key.len() < 16 {
            return Err(Error::Storage("Index key too short".to_string()));
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&key[key.len() - 16..]);
        Ok(uuid::Uuid::from_bytes(bytes))
    }

    // Wallets

    /// Get wallet by ID
    pub fn get_wallet(&self, wallet_id: WalletId) -> Result<Option<Wallet>> {
        self.get_value(CF_WALLETS, wallet_id.as_bytes())
    }

    /// All wallets, in creation order
    pub fn wallets(&self) -> Result<Vec<Wallet>> {
        self.values(CF_WALLETS)
    }

    // Vouchers

    /// Get voucher by ID
    pub fn get_voucher(&self, voucher_id: VoucherId) -> Result<Option<Voucher>> {
        self.get_value(CF_VOUCHERS, voucher_id.as_bytes())
    }

    /// All vouchers held by a wallet (any status)
    pub fn wallet_vouchers(&self, wallet_id: WalletId) -> Result<Vec<Voucher>> {
        let prefix = Self::index_key_wallet(IDX_WALLET_VOUCHER, wallet_id, None);
        let mut vouchers = Vec::new();
        for key in self.index_scan(&prefix)? {
            let voucher_id = VoucherId::from_uuid(Self::trailing_uuid(&key)?);
            let voucher = self.get_voucher(voucher_id)?.ok_or_else(|| {
                Error::Storage(format!("Dangling voucher index entry {}", voucher_id))
            })?;
            vouchers.push(voucher);
        }
        Ok(vouchers)
    }

    // Subsidies

    /// Get subsidy by ID
    pub fn get_subsidy(&self, subsidy_id: SubsidyId) -> Result<Option<Subsidy>> {
        self.get_value(CF_SUBSIDIES, subsidy_id.as_bytes())
    }

    /// All subsidies, in creation order
    pub fn subsidies(&self) -> Result<Vec<Subsidy>> {
        self.values(CF_SUBSIDIES)
    }

    /// Subsidy created by an issuance token
    pub fn issuance_token(&self, token: &str) -> Result<Option<SubsidyId>> {
        let cf = self.cf_handle(CF_INDICES)?;
        match self.db.get_cf(cf, Self::index_key_token(IDX_ISSUANCE_TOKEN, None, token))? {
            Some(bytes) => Ok(Some(SubsidyId::from_uuid(Self::trailing_uuid(&bytes)?))),
            None => Ok(None),
        }
    }

    // Vendors

    /// Get vendor by ID
    pub fn get_vendor(&self, vendor_id: &VendorId) -> Result<Option<Vendor>> {
        self.get_value(CF_VENDORS, vendor_id.as_str().as_bytes())
    }

    /// Resolve vendor by QR code
    pub fn vendor_by_qr(&self, qr_code: &str) -> Result<Option<Vendor>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let mut key = vec![IDX_VENDOR_QR];
        key.extend_from_slice(qr_code.as_bytes());
        match self.db.get_cf(cf, &key)? {
            Some(bytes) => {
                let vendor_id = VendorId::new(String::from_utf8_lossy(&bytes).into_owned());
                self.get_vendor(&vendor_id)
            }
            None => Ok(None),
        }
    }

    // Transactions

    /// Get transaction by ID
    pub fn get_transaction(&self, tx_id: TransactionId) -> Result<Option<Transaction>> {
        self.get_value(CF_TRANSACTIONS, tx_id.as_bytes())
    }

    /// Transaction that committed a wallet's idempotency token
    pub fn payment_token(&self, wallet_id: WalletId, token: &str) -> Result<Option<TransactionId>> {
        let cf = self.cf_handle(CF_INDICES)?;
        let key = Self::index_key_token(IDX_PAYMENT_TOKEN, Some(wallet_id), token);
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(TransactionId::from_uuid(Self::trailing_uuid(&bytes)?))),
            None => Ok(None),
        }
    }

    /// A wallet's transactions, newest first
    pub fn wallet_transactions(&self, wallet_id: WalletId, limit: usize) -> Result<Vec<Transaction>> {
        let prefix = Self::index_key_wallet(IDX_WALLET_TX, wallet_id, None);
        self.load_indexed_transactions(&prefix, limit)
    }

    /// A vendor's transactions, newest first
    pub fn vendor_transactions(&self, vendor_id: &VendorId, limit: usize) -> Result<Vec<Transaction>> {
        let prefix = Self::index_key_vendor_tx(vendor_id, None);
        self.load_indexed_transactions(&prefix, limit)
    }

    fn load_indexed_transactions(&self, prefix: &[u8], limit: usize) -> Result<Vec<Transaction>> {
        let mut txs = Vec::new();
        for key in self.index_scan_rev(prefix, limit)? {
            let tx_id = TransactionId::from_uuid(Self::trailing_uuid(&key)?);
            let tx = self
                .get_transaction(tx_id)?
                .ok_or_else(|| Error::Storage(format!("Dangling transaction index entry {}", tx_id)))?;
            txs.push(tx);
        }
        Ok(txs)
    }

    /// Most recent transactions across all wallets, newest first
    pub fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let mut txs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::End) {
            if txs.len() >= limit {
                break;
            }
            let (_, value) = item?;
            txs.push(bincode::deserialize(&value)?);
        }
        Ok(txs)
    }

    /// All transactions, oldest first
    pub fn transactions(&self) -> Result<Vec<Transaction>> {
        self.values(CF_TRANSACTIONS)
    }

    // Audit

    /// Newest audit entry a committed batch depends on
    pub fn audit_anchor(&self) -> Result<Option<AuditAnchor>> {
        self.get_value(CF_INDICES, &[IDX_AUDIT_ANCHOR])
    }

    // Outbox

    /// Pending notifications in commit order
    pub fn outbox_pending(&self, limit: usize) -> Result<Vec<(u64, Transaction)>> {
        let cf = self.cf_handle(CF_OUTBOX)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            if entries.len() >= limit {
                break;
            }
            let (key, value) = item?;
            entries.push((Self::decode_seq(&key)?, bincode::deserialize(&value)?));
        }
        Ok(entries)
    }

    /// Remove a delivered notification
    pub fn outbox_ack(&self, seq: u64) -> Result<()> {
        let cf = self.cf_handle(CF_OUTBOX)?;
        self.db.delete_cf(cf, seq.to_be_bytes())?;
        Ok(())
    }

    fn last_outbox_seq(&self) -> Result<Option<u64>> {
        let cf = self.cf_handle(CF_OUTBOX)?;
        if let Some(item) = self.db.iterator_cf(cf, IteratorMode::End).next() {
            let (key, _) = item?;
            return Ok(Some(Self::decode_seq(&key)?));
        }
        Ok(None)
    }

    fn decode_seq(key: &[u8]) -> Result<u64> {
        let bytes: [u8; 8] = key
            .try_into()
            .map_err(|_| Error::Storage("Malformed outbox key".to_string()))?;
        Ok(u64::from_be_bytes(bytes))
    }

    // Batch operations (atomic)

    /// Start an atomic batch
    pub fn batch(&self) -> StorageBatch<'_> {
        StorageBatch {
            storage: self,
            batch: WriteBatch::default(),
        }
    }

    // Index key helpers

    fn index_key_wallet(tag: u8, wallet_id: WalletId, child: Option<&uuid::Uuid>) -> Vec<u8> {
        let mut key = vec![tag];
        key.extend_from_slice(wallet_id.as_bytes());
        if let Some(child) = child {
            key.extend_from_slice(child.as_bytes());
        }
        key
    }

    fn index_key_vendor_tx(vendor_id: &VendorId, tx_id: Option<TransactionId>) -> Vec<u8> {
        let mut key = vec![IDX_VENDOR_TX];
        key.extend_from_slice(vendor_id.as_str().as_bytes());
        key.push(b'|'); // Separator
        if let Some(tx_id) = tx_id {
            key.extend_from_slice(tx_id.as_bytes());
        }
        key
    }

    fn index_key_token(tag: u8, wallet_id: Option<WalletId>, token: &str) -> Vec<u8> {
        let mut key = vec![tag];
        if let Some(wallet_id) = wallet_id {
            key.extend_from_slice(wallet_id.as_bytes());
        }
        key.extend_from_slice(token.as_bytes());
        key
    }

    fn index_key_qr(qr_code: &str) -> Vec<u8> {
        let mut key = vec![IDX_VENDOR_QR];
        key.extend_from_slice(qr_code.as_bytes());
        key
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            total_wallets: self.approximate_count(CF_WALLETS)?,
            total_vouchers: self.approximate_count(CF_VOUCHERS)?,
            total_transactions: self.approximate_count(CF_TRANSACTIONS)?,
            pending_notifications: self.approximate_count(CF_OUTBOX)?,
        })
    }

    fn approximate_count(&self, cf: &str) -> Result<u64> {
        let cf = self.cf_handle(cf)?;
        let prop = self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);
        Ok(prop)
    }
}

/// Atomic multi-record write
pub struct StorageBatch<'a> {
    storage: &'a Storage,
    batch: WriteBatch,
}

impl<'a> StorageBatch<'a> {
    /// Put wallet
    pub fn put_wallet(&mut self, wallet: &Wallet) -> Result<()> {
        let cf = self.storage.cf_handle(CF_WALLETS)?;
        self.batch
            .put_cf(cf, wallet.id.as_bytes(), bincode::serialize(wallet)?);
        Ok(())
    }

    /// Put voucher and its wallet index entry
    pub fn put_voucher(&mut self, voucher: &Voucher) -> Result<()> {
        let cf = self.storage.cf_handle(CF_VOUCHERS)?;
        self.batch
            .put_cf(cf, voucher.id.as_bytes(), bincode::serialize(voucher)?);

        let cf_indices = self.storage.cf_handle(CF_INDICES)?;
        let idx = Storage::index_key_wallet(
            IDX_WALLET_VOUCHER,
            voucher.wallet_id,
            Some(voucher.id.as_uuid()),
        );
        self.batch.put_cf(cf_indices, idx, []);
        Ok(())
    }

    /// Put subsidy
    pub fn put_subsidy(&mut self, subsidy: &Subsidy) -> Result<()> {
        let cf = self.storage.cf_handle(CF_SUBSIDIES)?;
        self.batch
            .put_cf(cf, subsidy.id.as_bytes(), bincode::serialize(subsidy)?);
        Ok(())
    }

    /// Record the subsidy created by an issuance token
    pub fn put_issuance_token(&mut self, token: &str, subsidy_id: SubsidyId) -> Result<()> {
        let cf = self.storage.cf_handle(CF_INDICES)?;
        let key = Storage::index_key_token(IDX_ISSUANCE_TOKEN, None, token);
        self.batch.put_cf(cf, key, subsidy_id.as_bytes());
        Ok(())
    }

    /// Put vendor and (re)point its QR index entry
    pub fn put_vendor(&mut self, vendor: &Vendor, previous_qr: Option<&str>) -> Result<()> {
        let cf = self.storage.cf_handle(CF_VENDORS)?;
        self.batch.put_cf(
            cf,
            vendor.vendor_id.as_str().as_bytes(),
            bincode::serialize(vendor)?,
        );

        let cf_indices = self.storage.cf_handle(CF_INDICES)?;
        if let Some(old) = previous_qr {
            if old != vendor.qr_code {
                self.batch.delete_cf(cf_indices, Storage::index_key_qr(old));
            }
        }
        self.batch.put_cf(
            cf_indices,
            Storage::index_key_qr(&vendor.qr_code),
            vendor.vendor_id.as_str().as_bytes(),
        );
        Ok(())
    }

    /// Put completed transaction with indices, idempotency token and outbox entry
    ///
    /// Returns the outbox sequence number assigned to the transaction.
    pub fn put_transaction(&mut self, tx: &Transaction) -> Result<u64> {
        let value = bincode::serialize(tx)?;

        let cf_tx = self.storage.cf_handle(CF_TRANSACTIONS)?;
        self.batch.put_cf(cf_tx, tx.id.as_bytes(), &value);

        let cf_indices = self.storage.cf_handle(CF_INDICES)?;

        // Index: wallet || tx -> empty
        let idx_wallet = Storage::index_key_wallet(IDX_WALLET_TX, tx.wallet_id, Some(tx.id.as_uuid()));
        self.batch.put_cf(cf_indices, idx_wallet, []);

        // Index: vendor | tx -> empty
        let idx_vendor = Storage::index_key_vendor_tx(&tx.vendor_id, Some(tx.id));
        self.batch.put_cf(cf_indices, idx_vendor, []);

        // Idempotency: wallet || token -> tx
        let idx_token =
            Storage::index_key_token(IDX_PAYMENT_TOKEN, Some(tx.wallet_id), &tx.idempotency_token);
        self.batch.put_cf(cf_indices, idx_token, tx.id.as_bytes());

        // Outbox: seq -> tx
        let seq = self.storage.next_outbox_seq.fetch_add(1, Ordering::SeqCst);
        let cf_outbox = self.storage.cf_handle(CF_OUTBOX)?;
        self.batch.put_cf(cf_outbox, seq.to_be_bytes(), &value);

        Ok(seq)
    }

    /// Record the audit entry this batch commits under
    pub fn put_audit_anchor(&mut self, anchor: &AuditAnchor) -> Result<()> {
        let cf = self.storage.cf_handle(CF_INDICES)?;
        self.batch
            .put_cf(cf, [IDX_AUDIT_ANCHOR], bincode::serialize(anchor)?);
        Ok(())
    }

    /// Atomic commit
    pub fn commit(self) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.storage.sync_writes);

        let records = self.batch.len();
        self.storage.db.write_opt(self.batch, &write_opts)?;

        tracing::debug!(records, "Batch committed");
        Ok(())
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Approximate wallet count
    pub total_wallets: u64,
    /// Approximate voucher count
    pub total_vouchers: u64,
    /// Approximate transaction count
    pub total_transactions: u64,
    /// Approximate undelivered notification count
    pub pending_notifications: u64,
}
