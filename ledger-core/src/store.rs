//! Voucher store: entity state, lock tables and compare-and-swap checks
//!
//! Wallet/voucher/subsidy state lives in [`Storage`]. Mutual exclusion is per
//! entity: one async mutex per wallet (payments) and one per subsidy key
//! (issuance, closing). Operations on different entities never contend.
//!
//! Balances are never stored; they are summed from active vouchers on read.

use crate::audit::AuditAnchor;
use crate::error::{Error, Result};
use crate::retry::conflict;
use crate::storage::Storage;
use crate::types::{
    active_balance, Subsidy, SubsidyId, Transaction, Vendor, Voucher, Wallet, WalletId,
};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable<K> = DashMap<K, Arc<Mutex<()>>>;

/// Entity store with per-entity locks
pub struct VoucherStore {
    storage: Storage,
    wallet_locks: LockTable<WalletId>,
    subsidy_locks: LockTable<String>,
    registry_lock: Arc<Mutex<()>>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for VoucherStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoucherStore")
            .field("storage", &self.storage)
            .field("wallet_locks", &self.wallet_locks.len())
            .field("subsidy_locks", &self.subsidy_locks.len())
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

/// Held entity lock
///
/// The table entry is removed when the last holder or waiter lets go, so
/// the tables only hold keys that are in use.
pub struct EntityGuard<'a, K: Eq + Hash> {
    table: &'a LockTable<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Display> std::fmt::Debug for EntityGuard<'_, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityGuard")
            .field("key", &format_args!("{}", self.key))
            .field("held", &self.guard.is_some())
            .finish()
    }
}

impl<K: Eq + Hash> Drop for EntityGuard<'_, K> {
    fn drop(&mut self) {
        self.guard.take();
        self.table
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Wait for an entity lock
///
/// The guard exists before the wait starts, so a waiter that times out or
/// is cancelled also cleans up the table entry.
async fn acquire<'a, K>(
    table: &'a LockTable<K>,
    key: K,
    timeout: Duration,
    what: &str,
) -> Result<EntityGuard<'a, K>>
where
    K: Eq + Hash + Clone + Display,
{
    let mutex = table.entry(key.clone()).or_default().clone();
    let mut held = EntityGuard {
        table,
        key,
        guard: None,
    };

    let locked = tokio::time::timeout(timeout, mutex.lock_owned()).await;
    match locked {
        Ok(guard) => {
            held.guard = Some(guard);
            Ok(held)
        }
        Err(_) => Err(Error::Timeout(format!(
            "{} lock {} not acquired within {}ms",
            what,
            held.key,
            timeout.as_millis()
        ))),
    }
}

impl VoucherStore {
    /// Wrap opened storage
    pub fn new(storage: Storage, lock_timeout: Duration) -> Self {
        Self {
            storage,
            wallet_locks: DashMap::new(),
            subsidy_locks: DashMap::new(),
            registry_lock: Arc::new(Mutex::new(())),
            lock_timeout,
        }
    }

    /// Underlying storage
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    // Locks

    /// Exclusive access to one wallet's vouchers and payment tokens
    pub async fn lock_wallet(&self, wallet_id: WalletId) -> Result<EntityGuard<'_, WalletId>> {
        acquire(&self.wallet_locks, wallet_id, self.lock_timeout, "Wallet").await
    }

    /// Exclusive access to one subsidy (keyed by issuance token or subsidy id)
    pub async fn lock_subsidy(&self, key: impl Into<String>) -> Result<EntityGuard<'_, String>> {
        acquire(&self.subsidy_locks, key.into(), self.lock_timeout, "Subsidy").await
    }

    /// Exclusive access to the vendor registry (QR uniqueness)
    pub async fn lock_registry(&self) -> Result<OwnedMutexGuard<()>> {
        tokio::time::timeout(self.lock_timeout, Arc::clone(&self.registry_lock).lock_owned())
            .await
            .map_err(|_| Error::Timeout("Vendor registry lock not acquired".to_string()))
    }

    // Reads

    /// Get wallet or fail
    pub fn wallet(&self, wallet_id: WalletId) -> Result<Wallet> {
        self.storage
            .get_wallet(wallet_id)?
            .ok_or(Error::WalletNotFound(wallet_id))
    }

    /// Active vouchers, oldest first (ties by id)
    pub fn active_vouchers(&self, wallet_id: WalletId) -> Result<Vec<Voucher>> {
        let mut vouchers: Vec<Voucher> = self
            .storage
            .wallet_vouchers(wallet_id)?
            .into_iter()
            .filter(Voucher::is_active)
            .collect();
        vouchers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(vouchers)
    }

    /// Sum of active voucher amounts
    pub fn available_balance(&self, wallet_id: WalletId) -> Result<Decimal> {
        let vouchers = self.storage.wallet_vouchers(wallet_id)?;
        active_balance(&vouchers)
    }

    /// Get subsidy or fail
    pub fn subsidy(&self, subsidy_id: SubsidyId) -> Result<Subsidy> {
        self.storage
            .get_subsidy(subsidy_id)?
            .ok_or(Error::SubsidyNotFound(subsidy_id))
    }

    // Compare-and-swap preconditions (run inside the audit section)

    /// Voucher unchanged since selection and token still unused
    pub fn check_payment(&self, selected: &Voucher, token: &str) -> Result<()> {
        match self.storage.get_voucher(selected.id)? {
            Some(ref stored) if stored == selected => {}
            _ => return Err(conflict(format!("Voucher {} changed since selection", selected.id))),
        }
        if self.storage.payment_token(selected.wallet_id, token)?.is_some() {
            return Err(conflict(format!("Token {} committed concurrently", token)));
        }
        Ok(())
    }

    /// Subsidy version unchanged since it was read
    pub fn check_subsidy(&self, expected: &Subsidy) -> Result<()> {
        match self.storage.get_subsidy(expected.id)? {
            Some(stored) if stored.version == expected.version => Ok(()),
            Some(stored) => Err(conflict(format!(
                "Subsidy {} at version {}, expected {}",
                expected.id, stored.version, expected.version
            ))),
            None => Err(Error::SubsidyNotFound(expected.id)),
        }
    }

    /// Issuance token not yet committed
    pub fn check_issuance_token(&self, token: &str) -> Result<()> {
        match self.storage.issuance_token(token)? {
            Some(existing) => Err(conflict(format!(
                "Issuance token {} committed concurrently as {}",
                token, existing
            ))),
            None => Ok(()),
        }
    }

    // Atomic writes (each also moves the audit anchor to its entry)

    /// Commit a payment: voucher state, transaction, token, outbox entry
    pub fn commit_payment(&self, voucher: &Voucher, tx: &Transaction, anchor: &AuditAnchor) -> Result<u64> {
        let mut batch = self.storage.batch();
        batch.put_voucher(voucher)?;
        let seq = batch.put_transaction(tx)?;
        batch.put_audit_anchor(anchor)?;
        batch.commit()?;
        Ok(seq)
    }

    /// Commit an issuance: subsidy, its vouchers, the issuance token
    pub fn commit_issuance(
        &self,
        subsidy: &Subsidy,
        vouchers: &[Voucher],
        token: &str,
        anchor: &AuditAnchor,
    ) -> Result<()> {
        let mut batch = self.storage.batch();
        batch.put_subsidy(subsidy)?;
        for voucher in vouchers {
            batch.put_voucher(voucher)?;
        }
        batch.put_issuance_token(token, subsidy.id)?;
        batch.put_audit_anchor(anchor)?;
        batch.commit()
    }

    /// Commit an updated subsidy
    pub fn commit_subsidy(&self, subsidy: &Subsidy, anchor: &AuditAnchor) -> Result<()> {
        let mut batch = self.storage.batch();
        batch.put_subsidy(subsidy)?;
        batch.put_audit_anchor(anchor)?;
        batch.commit()
    }

    /// Commit a new wallet
    pub fn commit_wallet(&self, wallet: &Wallet, anchor: &AuditAnchor) -> Result<()> {
        let mut batch = self.storage.batch();
        batch.put_wallet(wallet)?;
        batch.put_audit_anchor(anchor)?;
        batch.commit()
    }

    /// Commit a vendor record
    pub fn commit_vendor(
        &self,
        vendor: &Vendor,
        previous_qr: Option<&str>,
        anchor: &AuditAnchor,
    ) -> Result<()> {
        let mut batch = self.storage.batch();
        batch.put_vendor(vendor, previous_qr)?;
        batch.put_audit_anchor(anchor)?;
        batch.commit()
    }
}
