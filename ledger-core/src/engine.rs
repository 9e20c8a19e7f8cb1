//! Ledger engine: the only API through which funds move
//!
//! Ties together the voucher store, the audit log and the settlement
//! notifier.
//!
//! # Commit protocol
//!
//! Every mutation runs as:
//!
//! 1. Acquire the entity lock (wallet, subsidy or vendor registry), bounded by
//!    `concurrency.lock_timeout_ms`.
//! 2. Read state and decide (voucher selection, idempotency lookup).
//! 3. Inside the audit single-writer section: compare-and-swap check, audit
//!    append (fsynced), entity `WriteBatch`.
//!
//! Step 3 is synchronous, so a dropped caller future either never reaches it
//! or observes all of it. On a multi-threaded runtime it runs under
//! `block_in_place`, and entering it waits at most
//! `concurrency.write_timeout_ms`. A conflicting CAS check yields
//! [`Error::PersistenceConflict`], which the retry strategy absorbs.
//!
//! Every entity batch also stores the audit anchor (entry count and hash of
//! the entry it commits under). Verification requires the log to still hold
//! that entry, so trailing entries cut from the file are caught across
//! restarts.
//!
//! # Example
//!
//! ```no_run
//! use voucher_ledger::{Config, LedgerEngine, PaymentRequest, Principal};
//!
//! #[tokio::main]
//! async fn main() -> voucher_ledger::Result<()> {
//!     let engine = LedgerEngine::open(Config::default()).await?;
//!
//!     // let session = Principal::beneficiary("citizen-1", wallet_id);
//!     // let tx = engine.process_payment(&session, request).await?;
//!
//!     engine.shutdown().await
//! }
//! ```

use crate::{
    audit::{AuditAction, AuditAnchor, AuditEntry, AuditEvent, AuditFilter, AuditLog, VerifyReport},
    config::PartialUsePolicy,
    metrics::Metrics,
    notifier::{spawn_notifier, NotifierHandle, SettlementSink},
    retry::RetryStrategy,
    storage::{Storage, StorageStats},
    store::VoucherStore,
    types::{
        active_balance, checked_add, DisbursementSummary, IssuanceRequest, PaymentRequest, Principal, Role,
        Subsidy, SubsidyId, SubsidyStatus, Transaction, TransactionId, TransactionStatus, Vendor,
        VendorId, VendorRegistration, Voucher, VoucherId, VoucherStatus, Wallet, WalletId,
        WalletSummary,
    },
    Config, Error, Result,
};
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::RuntimeFlavor;

/// Actor id recorded for entries the engine writes on its own behalf
const SYSTEM_ACTOR: &str = "voucher-ledger";

enum PaymentOutcome {
    Committed(Transaction),
    Replayed(Transaction),
}

/// Main ledger interface
pub struct LedgerEngine {
    /// Configuration
    config: Config,

    /// Entity state and locks
    store: Arc<VoucherStore>,

    /// Hash-chained audit trail
    audit: AuditLog,

    /// Conflict retry
    retry: RetryStrategy,

    /// Prometheus metrics
    metrics: Metrics,

    /// Outbox dispatcher
    notifier: NotifierHandle,

    /// Reason commits are refused, if halted
    halted: RwLock<Option<String>>,
}

impl std::fmt::Debug for LedgerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerEngine")
            .field("store", &self.store)
            .field("audit", &self.audit)
            .field("halted", &*self.halted.read())
            .finish()
    }
}

impl LedgerEngine {
    /// Open ledger with configuration
    ///
    /// With `audit.verify_on_open`, a broken chain does not fail the open; the
    /// engine starts halted and only serves reads until an operator resumes it.
    pub async fn open(config: Config) -> Result<Self> {
        let storage = Storage::open(&config)?;
        let store = Arc::new(VoucherStore::new(
            storage,
            Duration::from_millis(config.concurrency.lock_timeout_ms),
        ));
        let audit = AuditLog::open(&config.audit)?;
        let metrics = Metrics::new()
            .map_err(|e| Error::Other(format!("Failed to register metrics: {}", e)))?;
        let notifier = spawn_notifier(store.clone(), config.notifier.clone(), metrics.clone());

        let engine = Self {
            retry: RetryStrategy::new(config.retry.clone()),
            config,
            store,
            audit,
            metrics,
            notifier,
            halted: RwLock::new(None),
        };

        if engine.config.audit.verify_on_open {
            match engine.verify_audit_chain() {
                Ok(()) | Err(Error::AuditChainBroken { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            service = %engine.config.service_name,
            version = %engine.config.service_version,
            audit_entries = engine.audit.len(),
            halted = engine.is_halted(),
            "Ledger engine opened"
        );

        Ok(engine)
    }

    // Payments

    /// Pay a vendor from a wallet, funded by a single covering voucher
    ///
    /// A repeated call with the same idempotency token, vendor and amount
    /// returns the original transaction without a second debit.
    pub async fn process_payment(
        &self,
        principal: &Principal,
        request: PaymentRequest,
    ) -> Result<Transaction> {
        let started = Instant::now();

        match self.process_payment_inner(principal, &request).await {
            Ok(PaymentOutcome::Committed(tx)) => {
                self.metrics.record_payment(started.elapsed().as_secs_f64());
                self.notifier.wake();
                tracing::info!(
                    transaction_id = %tx.id,
                    wallet_id = %tx.wallet_id,
                    voucher_id = %tx.voucher_id,
                    vendor_id = %tx.vendor_id,
                    amount = %tx.amount,
                    "Payment committed"
                );
                Ok(tx)
            }
            Ok(PaymentOutcome::Replayed(tx)) => {
                self.metrics.record_payment_replay();
                tracing::warn!(
                    transaction_id = %tx.id,
                    wallet_id = %tx.wallet_id,
                    token = %tx.idempotency_token,
                    "Idempotent payment replay"
                );
                Ok(tx)
            }
            Err(e) => {
                self.metrics.record_payment_failure(e.kind());
                tracing::info!(
                    wallet_id = %request.wallet_id,
                    amount = %request.amount,
                    reason = e.kind(),
                    "Payment rejected: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn process_payment_inner(
        &self,
        principal: &Principal,
        request: &PaymentRequest,
    ) -> Result<PaymentOutcome> {
        if !principal.can_spend_from(request.wallet_id) {
            return Err(Error::Unauthorized(format!(
                "{} may not spend from wallet {}",
                principal.actor_id, request.wallet_id
            )));
        }
        if request.amount <= Decimal::ZERO {
            return Err(Error::InvalidRequest(format!(
                "Payment amount must be positive, got {}",
                request.amount
            )));
        }
        if request.idempotency_token.trim().is_empty() {
            return Err(Error::InvalidRequest(
                "Idempotency token must not be empty".to_string(),
            ));
        }
        self.ensure_running()?;

        let vendor = self
            .store
            .storage()
            .vendor_by_qr(&request.vendor_qr_code)?
            .filter(|v| v.is_active)
            .ok_or_else(|| Error::VendorUnavailable(request.vendor_qr_code.clone()))?;
        self.store.wallet(request.wallet_id)?;

        let _wallet_guard = self.store.lock_wallet(request.wallet_id).await?;

        let vendor = &vendor;
        self.retry
            .execute_with_retry(
                move || async move { self.attempt_payment(principal, request, vendor) },
                "process_payment",
                Some(&self.metrics),
            )
            .await
    }

    /// One payment attempt under the wallet lock
    fn attempt_payment(
        &self,
        principal: &Principal,
        request: &PaymentRequest,
        vendor: &Vendor,
    ) -> Result<PaymentOutcome> {
        let storage = self.store.storage();
        let token = request.idempotency_token.as_str();

        if let Some(original_id) = storage.payment_token(request.wallet_id, token)? {
            let original = storage.get_transaction(original_id)?.ok_or_else(|| {
                Error::Storage(format!("Token {} points at missing transaction", token))
            })?;
            if original.vendor_id == vendor.vendor_id && original.amount == request.amount {
                return Ok(PaymentOutcome::Replayed(original));
            }
            return Err(Error::DuplicatePayment {
                token: token.to_string(),
                transaction_id: original_id,
            });
        }

        let vouchers = self.store.active_vouchers(request.wallet_id)?;
        let available = active_balance(&vouchers)?;
        if request.amount > available {
            return Err(Error::InsufficientBalance {
                requested: request.amount,
                available,
            });
        }

        let selected = select_covering_voucher(&vouchers, request.amount)
            .ok_or_else(|| Error::NoSingleVoucherCovers {
                requested: request.amount,
                largest: vouchers.iter().map(|v| v.amount).max().unwrap_or_default(),
            })?
            .clone();
        let debited = debit_voucher(&selected, request.amount, self.config.payments.partial_use);

        let tx_id = TransactionId::new();
        let event = AuditEvent::new(
            principal.actor_id.clone(),
            AuditAction::PaymentCompleted,
            format!(
                "Transaction {} wallet {} voucher {} paid {} to vendor {} ({})",
                tx_id, request.wallet_id, selected.id, request.amount, vendor.vendor_id, vendor.vendor_name
            ),
        );

        let (_, tx) = self.commit_with_audit(
            event,
            || self.store.check_payment(&selected, token),
            |entry, anchor| {
                let tx = Transaction {
                    id: tx_id,
                    wallet_id: request.wallet_id,
                    voucher_id: selected.id,
                    vendor_id: vendor.vendor_id.clone(),
                    vendor_name: vendor.vendor_name.clone(),
                    amount: request.amount,
                    purpose: selected.purpose.clone(),
                    status: TransactionStatus::Completed,
                    idempotency_token: token.to_string(),
                    created_at: entry.timestamp,
                    prev_hash: entry.prev_hash.clone(),
                    hash: entry.hash.clone(),
                };
                self.store.commit_payment(&debited, &tx, anchor)?;
                Ok(tx)
            },
        )?;

        Ok(PaymentOutcome::Committed(tx))
    }

    // Issuance

    /// Issue a subsidy: one active voucher per existing wallet
    ///
    /// Idempotent by issuance token.
    pub async fn issue_subsidy(
        &self,
        principal: &Principal,
        request: IssuanceRequest,
    ) -> Result<Subsidy> {
        require_authority(principal, "issue subsidies")?;
        if request.amount_per_beneficiary <= Decimal::ZERO {
            return Err(Error::InvalidRequest(format!(
                "Amount per beneficiary must be positive, got {}",
                request.amount_per_beneficiary
            )));
        }
        if request.subsidy_type.trim().is_empty() {
            return Err(Error::InvalidRequest("Subsidy type must not be empty".to_string()));
        }
        if request.issuance_token.trim().is_empty() {
            return Err(Error::InvalidRequest("Issuance token must not be empty".to_string()));
        }
        self.ensure_running()?;

        let _subsidy_guard = self
            .store
            .lock_subsidy(format!("issuance:{}", request.issuance_token))
            .await?;

        let request = &request;
        self.retry
            .execute_with_retry(
                move || async move { self.attempt_issuance(principal, request) },
                "issue_subsidy",
                Some(&self.metrics),
            )
            .await
    }

    fn attempt_issuance(&self, principal: &Principal, request: &IssuanceRequest) -> Result<Subsidy> {
        let storage = self.store.storage();
        let token = request.issuance_token.as_str();

        if let Some(existing) = storage.issuance_token(token)? {
            tracing::warn!(subsidy_id = %existing, token, "Idempotent issuance replay");
            return self.store.subsidy(existing);
        }

        let wallets = storage.wallets()?;
        let now = Utc::now();
        let subsidy_id = SubsidyId::new();

        // Every credited wallet must keep a representable balance
        for wallet in &wallets {
            let balance = self.store.available_balance(wallet.id)?;
            checked_add(balance, request.amount_per_beneficiary, "Wallet balance after issuance")?;
        }

        let vouchers: Vec<Voucher> = wallets
            .iter()
            .map(|wallet| Voucher {
                id: VoucherId::new(),
                wallet_id: wallet.id,
                subsidy_id,
                amount: request.amount_per_beneficiary,
                purpose: request.subsidy_type.clone(),
                status: VoucherStatus::Active,
                created_at: now,
            })
            .collect();
        let count = vouchers.len() as u64;
        let total_disbursed = request
            .amount_per_beneficiary
            .checked_mul(Decimal::from(count))
            .ok_or_else(|| {
                Error::AmountOverflow(format!(
                    "{} to each of {} beneficiaries exceeds {}",
                    request.amount_per_beneficiary,
                    count,
                    Decimal::MAX
                ))
            })?;

        let subsidy = Subsidy {
            id: subsidy_id,
            name: request.subsidy_type.clone(),
            purpose: request.purpose.clone(),
            amount_per_beneficiary: request.amount_per_beneficiary,
            beneficiary_count: count,
            total_disbursed,
            status: SubsidyStatus::Active,
            issued_by: principal.actor_id.clone(),
            created_at: now,
            version: 1,
        };

        let event = AuditEvent::new(
            principal.actor_id.clone(),
            AuditAction::SubsidyIssued,
            format!(
                "Subsidy {} {} issued {} to {} beneficiaries (total {})",
                subsidy.id, subsidy.name, subsidy.amount_per_beneficiary, count, subsidy.total_disbursed
            ),
        );

        self.commit_with_audit(
            event,
            || self.store.check_issuance_token(token),
            |_, anchor| self.store.commit_issuance(&subsidy, &vouchers, token, anchor),
        )?;

        self.metrics.record_issuance(count);
        tracing::info!(
            subsidy_id = %subsidy.id,
            subsidy_type = %subsidy.name,
            beneficiaries = count,
            total_disbursed = %subsidy.total_disbursed,
            "Subsidy issued"
        );

        Ok(subsidy)
    }

    /// Close a subsidy programme; vouchers already issued stay spendable
    pub async fn close_subsidy(&self, principal: &Principal, subsidy_id: SubsidyId) -> Result<Subsidy> {
        require_authority(principal, "close subsidies")?;
        self.ensure_running()?;
        self.store.subsidy(subsidy_id)?;

        let _subsidy_guard = self.store.lock_subsidy(subsidy_id.to_string()).await?;

        self.retry
            .execute_with_retry(
                move || async move { self.attempt_close(principal, subsidy_id) },
                "close_subsidy",
                Some(&self.metrics),
            )
            .await
    }

    fn attempt_close(&self, principal: &Principal, subsidy_id: SubsidyId) -> Result<Subsidy> {
        let current = self.store.subsidy(subsidy_id)?;
        if current.status == SubsidyStatus::Closed {
            return Ok(current);
        }

        let mut closed = current.clone();
        closed.status = SubsidyStatus::Closed;
        closed.version += 1;

        let event = AuditEvent::new(
            principal.actor_id.clone(),
            AuditAction::SubsidyClosed,
            format!("Subsidy {} {} closed", closed.id, closed.name),
        );
        self.commit_with_audit(
            event,
            || self.store.check_subsidy(&current),
            |_, anchor| self.store.commit_subsidy(&closed, anchor),
        )?;

        tracing::info!(subsidy_id = %closed.id, "Subsidy closed");
        Ok(closed)
    }

    // Onboarding and vendor registry

    /// Open an empty wallet for a beneficiary
    pub async fn open_wallet(&self, principal: &Principal, holder_ref: &str) -> Result<Wallet> {
        require_authority(principal, "open wallets")?;
        if holder_ref.trim().is_empty() {
            return Err(Error::InvalidRequest("Holder reference must not be empty".to_string()));
        }

        let wallet = Wallet {
            id: WalletId::new(),
            holder_ref: holder_ref.to_string(),
            created_at: Utc::now(),
        };
        let event = AuditEvent::new(
            principal.actor_id.clone(),
            AuditAction::WalletOpened,
            format!("Wallet {} opened for {}", wallet.id, wallet.holder_ref),
        );
        self.commit_with_audit(event, || Ok(()), |_, anchor| self.store.commit_wallet(&wallet, anchor))?;

        tracing::info!(wallet_id = %wallet.id, "Wallet opened");
        Ok(wallet)
    }

    /// Import or update a vendor from the external registry
    pub async fn register_vendor(
        &self,
        principal: &Principal,
        registration: VendorRegistration,
    ) -> Result<Vendor> {
        require_authority(principal, "register vendors")?;
        let id = registration.vendor_id.as_str();
        if id.trim().is_empty() || id.contains('|') {
            return Err(Error::InvalidRequest(format!("Invalid vendor id {:?}", id)));
        }
        if registration.qr_code.trim().is_empty() {
            return Err(Error::InvalidRequest("QR code must not be empty".to_string()));
        }

        let _registry_guard = self.store.lock_registry().await?;
        let storage = self.store.storage();

        if let Some(owner) = storage.vendor_by_qr(&registration.qr_code)? {
            if owner.vendor_id != registration.vendor_id {
                return Err(Error::InvalidRequest(format!(
                    "QR code already assigned to vendor {}",
                    owner.vendor_id
                )));
            }
        }

        let previous = storage.get_vendor(&registration.vendor_id)?;
        let vendor = Vendor::from(registration);
        let event = AuditEvent::new(
            principal.actor_id.clone(),
            AuditAction::VendorRegistered,
            format!(
                "Vendor {} {} ({}) registered, active={}",
                vendor.vendor_id, vendor.vendor_name, vendor.business_type, vendor.is_active
            ),
        );
        self.commit_with_audit(
            event,
            || Ok(()),
            |_, anchor| {
                self.store.commit_vendor(
                    &vendor,
                    previous.as_ref().map(|v| v.qr_code.as_str()),
                    anchor,
                )
            },
        )?;

        tracing::info!(vendor_id = %vendor.vendor_id, "Vendor registered");
        Ok(vendor)
    }

    /// Activate or deactivate a vendor
    pub async fn set_vendor_active(
        &self,
        principal: &Principal,
        vendor_id: &VendorId,
        active: bool,
    ) -> Result<Vendor> {
        require_authority(principal, "change vendor status")?;

        let _registry_guard = self.store.lock_registry().await?;
        let current = self
            .store
            .storage()
            .get_vendor(vendor_id)?
            .ok_or_else(|| Error::VendorNotFound(vendor_id.clone()))?;
        if current.is_active == active {
            return Ok(current);
        }

        let mut updated = current.clone();
        updated.is_active = active;
        let event = AuditEvent::new(
            principal.actor_id.clone(),
            AuditAction::VendorStatusChanged,
            format!("Vendor {} active={}", vendor_id, active),
        );
        self.commit_with_audit(
            event,
            || Ok(()),
            |_, anchor| self.store.commit_vendor(&updated, Some(&current.qr_code), anchor),
        )?;

        tracing::info!(vendor_id = %vendor_id, active, "Vendor status changed");
        Ok(updated)
    }

    // Reads

    /// Wallet with its active vouchers and derived balance
    pub fn wallet_summary(&self, wallet_id: WalletId) -> Result<WalletSummary> {
        let wallet = self.store.wallet(wallet_id)?;
        let active_vouchers = self.store.active_vouchers(wallet_id)?;
        let available_balance = active_balance(&active_vouchers)?;
        Ok(WalletSummary {
            wallet,
            active_vouchers,
            available_balance,
        })
    }

    /// Sum of a wallet's active voucher amounts
    pub fn available_balance(&self, wallet_id: WalletId) -> Result<Decimal> {
        self.store.wallet(wallet_id)?;
        self.store.available_balance(wallet_id)
    }

    /// All vouchers of a wallet, any status
    pub fn wallet_vouchers(&self, wallet_id: WalletId) -> Result<Vec<Voucher>> {
        self.store.storage().wallet_vouchers(wallet_id)
    }

    /// A wallet's transactions, newest first
    pub fn wallet_transactions(&self, wallet_id: WalletId, limit: usize) -> Result<Vec<Transaction>> {
        self.store.storage().wallet_transactions(wallet_id, limit)
    }

    /// A vendor's transactions, newest first
    pub fn vendor_transactions(&self, vendor_id: &VendorId, limit: usize) -> Result<Vec<Transaction>> {
        self.store.storage().vendor_transactions(vendor_id, limit)
    }

    /// Latest transactions across all wallets, newest first
    pub fn recent_transactions(&self, limit: usize) -> Result<Vec<Transaction>> {
        self.store.storage().recent_transactions(limit)
    }

    /// Transaction by id
    pub fn transaction(&self, tx_id: TransactionId) -> Result<Option<Transaction>> {
        self.store.storage().get_transaction(tx_id)
    }

    /// Vendor by id
    pub fn vendor(&self, vendor_id: &VendorId) -> Result<Option<Vendor>> {
        self.store.storage().get_vendor(vendor_id)
    }

    /// Subsidy by id
    pub fn subsidy(&self, subsidy_id: SubsidyId) -> Result<Subsidy> {
        self.store.subsidy(subsidy_id)
    }

    /// Subsidies, newest first
    pub fn subsidies(&self, active_only: bool) -> Result<Vec<Subsidy>> {
        let mut subsidies = self.store.storage().subsidies()?;
        subsidies.retain(|s| !active_only || s.status == SubsidyStatus::Active);
        subsidies.reverse();
        Ok(subsidies)
    }

    /// Authority dashboard figures
    pub fn disbursement_summary(&self) -> Result<DisbursementSummary> {
        let mut summary = DisbursementSummary::default();

        for subsidy in self.store.storage().subsidies()? {
            summary.total_disbursed =
                checked_add(summary.total_disbursed, subsidy.total_disbursed, "Total disbursed")?;
            summary.total_beneficiaries += subsidy.beneficiary_count;
            if subsidy.status == SubsidyStatus::Active {
                summary.active_programs += 1;
            }
        }

        for tx in self.store.storage().transactions()? {
            if tx.status == TransactionStatus::Completed {
                summary.transaction_count += 1;
                summary.total_redeemed =
                    checked_add(summary.total_redeemed, tx.amount, "Total redeemed")?;
            }
        }

        Ok(summary)
    }

    /// Approximate record counts
    pub fn store_stats(&self) -> Result<StorageStats> {
        self.store.storage().get_stats()
    }

    /// Audit entries matching a filter
    pub fn audit_trail(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.audit.search(filter)
    }

    // Audit integrity

    /// Replay the audit chain; a broken chain halts all commits
    ///
    /// The chain must also reach the entry the last committed batch was
    /// anchored to.
    pub fn verify_audit_chain(&self) -> Result<()> {
        let report = self.chain_report()?;
        if let Some(index) = report.first_broken {
            self.halt(format!("Audit chain broken at entry {}", index));
        } else {
            tracing::info!(entries = report.entries, "Audit chain verified");
        }
        report.into_result()
    }

    /// Lift a halt after the chain has been repaired
    pub fn resume_after_remediation(&self, principal: &Principal) -> Result<()> {
        if principal.role != Role::Operator {
            return Err(Error::Unauthorized(format!(
                "{} may not resume the ledger",
                principal.actor_id
            )));
        }

        let report = self.chain_report()?;
        if let Some(index) = report.first_broken {
            tracing::error!(index, "Resume refused, audit chain still broken");
            return Err(Error::AuditChainBroken { index });
        }

        let previous = self.halted.write().take();
        self.metrics.set_halted(false);
        tracing::info!(
            actor_id = %principal.actor_id,
            reason = previous.as_deref().unwrap_or("none"),
            "Ledger resumed"
        );
        Ok(())
    }

    fn chain_report(&self) -> Result<VerifyReport> {
        let anchor = self.store.storage().audit_anchor()?;
        self.audit.verify_against(anchor.as_ref())
    }

    /// Whether commits are currently refused
    pub fn is_halted(&self) -> bool {
        self.halted.read().is_some()
    }

    fn ensure_running(&self) -> Result<()> {
        match self.halted.read().as_ref() {
            Some(reason) => Err(Error::LedgerHalted(reason.clone())),
            None => Ok(()),
        }
    }

    fn halt(&self, reason: String) {
        tracing::error!(reason = %reason, "Ledger halted");
        *self.halted.write() = Some(reason);
        self.metrics.set_halted(true);
    }

    /// CAS check, audit append and entity write as one unit
    ///
    /// Runs under the audit writer lock and never awaits. The entry is on disk
    /// before `write` runs; if `write` fails a `commit_aborted` entry records the
    /// orphaned hash, and if that also fails the engine halts. An append that
    /// leaves the log damaged halts the engine as well.
    fn commit_with_audit<T>(
        &self,
        event: AuditEvent,
        check: impl FnOnce() -> Result<()>,
        write: impl FnOnce(&AuditEntry, &AuditAnchor) -> Result<T>,
    ) -> Result<(AuditEntry, T)> {
        let write_timeout = Duration::from_millis(self.config.concurrency.write_timeout_ms);

        run_blocking(|| {
            let mut writer = self.audit.begin_within(write_timeout)?;
            self.ensure_running()?;
            check()?;

            let started = Instant::now();
            let entry = match writer.append(event) {
                Ok(entry) => entry,
                Err(e @ Error::AuditChainBroken { .. }) => {
                    drop(writer);
                    self.halt(format!("Audit append left the log inconsistent: {}", e));
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            let elapsed = started.elapsed();
            self.metrics.record_audit_entry(elapsed.as_secs_f64());
            if elapsed > write_timeout {
                tracing::warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    limit_ms = write_timeout.as_millis() as u64,
                    "Durable audit write exceeded the write timeout"
                );
            }

            let anchor = writer.anchor();
            match write(&entry, &anchor) {
                Ok(value) => Ok((entry, value)),
                Err(e) => {
                    let abort = AuditEvent::new(
                        SYSTEM_ACTOR,
                        AuditAction::CommitAborted,
                        format!("Entity write for entry {} failed: {}", entry.hash, e),
                    );
                    let started = Instant::now();
                    match writer.append(abort) {
                        Ok(_) => {
                            self.metrics.record_audit_entry(started.elapsed().as_secs_f64());
                            tracing::warn!(hash = %entry.hash, error = %e, "Commit aborted after audit append");
                        }
                        Err(abort_err) => {
                            drop(writer);
                            self.halt(format!(
                                "Could not record aborted commit {}: {}",
                                entry.hash, abort_err
                            ));
                        }
                    }
                    Err(e)
                }
            }
        })
    }

    // Plumbing

    /// Register a settlement sink with the notifier
    pub async fn subscribe(&self, sink: Arc<dyn SettlementSink>) -> Result<()> {
        self.notifier.subscribe(sink).await
    }

    /// Notifier handle
    pub fn notifier(&self) -> &NotifierHandle {
        &self.notifier
    }

    /// Audit log
    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the notifier
    pub async fn shutdown(&self) -> Result<()> {
        self.notifier.shutdown().await?;
        tracing::info!("Ledger engine shut down");
        Ok(())
    }
}

/// Run blocking work without stalling other tasks on this worker
///
/// Uses `block_in_place` on a multi-threaded runtime; elsewhere (current
/// thread runtime, no runtime) runs inline.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn require_authority(principal: &Principal, action: &str) -> Result<()> {
    if principal.role == Role::Authority {
        Ok(())
    } else {
        Err(Error::Unauthorized(format!("{} may not {}", principal.actor_id, action)))
    }
}

/// Oldest active voucher covering `amount` (ties broken by id)
pub fn select_covering_voucher(vouchers: &[Voucher], amount: Decimal) -> Option<&Voucher> {
    vouchers
        .iter()
        .filter(|v| v.is_active() && v.amount >= amount)
        .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
}

/// Voucher state after paying `amount` from it
///
/// A full-amount payment always uses the voucher up; a partial payment follows
/// the policy.
pub fn debit_voucher(voucher: &Voucher, amount: Decimal, policy: PartialUsePolicy) -> Voucher {
    if amount >= voucher.amount {
        return voucher.clone().into_used();
    }
    match policy {
        PartialUsePolicy::RetainVoucher => voucher.clone(),
        PartialUsePolicy::DeductRemaining => {
            let mut remaining = voucher.clone();
            remaining.amount -= amount;
            remaining
        }
    }
}
