//! Tamper-evident audit trail
//!
//! Append-only JSON-lines file, one entry per committing mutation. Each entry
//! stores `hash = SHA-256(prev_hash || bincode(id, timestamp_nanos, actor_id,
//! action_type, details_text))`, chained from a per-deployment genesis hash.
//!
//! The log lives outside RocksDB. Writers go through [`AuditWriter`], which
//! holds the single-writer lock; the engine keeps it across the CAS check,
//! the append and the entity `WriteBatch`.

use crate::config::AuditConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

const GENESIS_PREFIX: &str = "voucher-ledger-genesis:";

/// Kind of audited mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Payment committed
    PaymentCompleted,
    /// Subsidy issued with its vouchers
    SubsidyIssued,
    /// Subsidy closed
    SubsidyClosed,
    /// Wallet onboarded
    WalletOpened,
    /// Vendor imported or updated
    VendorRegistered,
    /// Vendor activated or deactivated
    VendorStatusChanged,
    /// Entity write failed after its entry was appended
    CommitAborted,
}

impl AuditAction {
    /// Stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::PaymentCompleted => "payment_completed",
            AuditAction::SubsidyIssued => "subsidy_issued",
            AuditAction::SubsidyClosed => "subsidy_closed",
            AuditAction::WalletOpened => "wallet_opened",
            AuditAction::VendorRegistered => "vendor_registered",
            AuditAction::VendorStatusChanged => "vendor_status_changed",
            AuditAction::CommitAborted => "commit_aborted",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event to be appended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    /// Acting principal
    pub actor_id: String,
    /// Action type
    pub action: AuditAction,
    /// Free-form details
    pub details: String,
}

impl AuditEvent {
    /// Create new event
    pub fn new(actor_id: impl Into<String>, action: AuditAction, details: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            action,
            details: details.into(),
        }
    }
}

/// Persisted audit entry (one JSON object per line)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Entry ID
    pub id: Uuid,
    /// Append time
    pub timestamp: DateTime<Utc>,
    /// Acting principal
    pub actor_id: String,
    /// Action type
    pub action_type: AuditAction,
    /// Free-form details
    pub details_text: String,
    /// Hash of the preceding entry (genesis hash for the first)
    pub prev_hash: String,
    /// Hash of this entry
    pub hash: String,
}

#[derive(Serialize)]
struct CanonicalEvent<'a> {
    id: &'a [u8; 16],
    timestamp_nanos: i64,
    actor_id: &'a str,
    action_type: &'a str,
    details_text: &'a str,
}

impl AuditEntry {
    /// Compute the chained hash for this entry's content
    pub fn compute_hash(&self) -> Result<String> {
        let canonical = CanonicalEvent {
            id: self.id.as_bytes(),
            timestamp_nanos: self.timestamp.timestamp_nanos_opt().unwrap_or_default(),
            actor_id: &self.actor_id,
            action_type: self.action_type.as_str(),
            details_text: &self.details_text,
        };

        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(bincode::serialize(&canonical)?);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Check the stored hash against a fresh recomputation
    pub fn verify_hash(&self) -> bool {
        matches!(self.compute_hash(), Ok(hash) if hash == self.hash)
    }
}

/// Search filter for [`AuditLog::search`]
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Only this action type
    pub action: Option<AuditAction>,
    /// Only this actor
    pub actor_id: Option<String>,
    /// Not before
    pub start: Option<DateTime<Utc>>,
    /// Not after
    pub end: Option<DateTime<Utc>>,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(action) = self.action {
            if entry.action_type != action {
                return false;
            }
        }
        if let Some(ref actor) = self.actor_id {
            if &entry.actor_id != actor {
                return false;
            }
        }
        if let Some(start) = self.start {
            if entry.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if entry.timestamp > end {
                return false;
            }
        }
        true
    }
}

/// Result of a full chain replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    /// Entries read
    pub entries: u64,
    /// Zero-based index of the first broken entry
    pub first_broken: Option<u64>,
}

impl VerifyReport {
    /// Whether the whole chain links
    pub fn is_intact(&self) -> bool {
        self.first_broken.is_none()
    }

    /// Broken chain as the fatal error
    pub fn into_result(self) -> Result<()> {
        match self.first_broken {
            Some(index) => Err(Error::AuditChainBroken { index }),
            None => Ok(()),
        }
    }
}

/// Position of the newest entry an entity write depends on
///
/// Stored in the same `WriteBatch` as the entity records, so on reopen the
/// log must still hold this entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditAnchor {
    /// Entry count once the entry was appended
    pub len: u64,
    /// Hash of that entry
    pub hash: String,
}

/// Durable append target
trait LogFile: Write {
    fn size(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LogFile for File {
    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

#[derive(Debug)]
enum AppendFailure {
    /// The file is back at its length before the write
    RolledBack(io::Error),
    /// Part of the line may still be in the file
    Damaged { cause: io::Error, rollback: io::Error },
}

/// Write and fsync one line, or cut the file back to where it started
fn append_line<F: LogFile>(file: &mut F, line: &[u8]) -> std::result::Result<(), AppendFailure> {
    let offset = file.size().map_err(AppendFailure::RolledBack)?;

    let cause = match file.write_all(line).and_then(|()| file.sync()) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    match file.truncate(offset).and_then(|()| file.sync()) {
        Ok(()) => Err(AppendFailure::RolledBack(cause)),
        Err(rollback) => Err(AppendFailure::Damaged { cause, rollback }),
    }
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

struct AuditState {
    file: File,
    head: String,
    len: u64,
    /// A failed append could not be rolled back
    damaged: bool,
}

/// Hash-chained audit log
pub struct AuditLog {
    path: PathBuf,
    genesis: String,
    state: Mutex<AuditState>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("path", &self.path)
            .field("genesis", &self.genesis)
            .finish()
    }
}

impl AuditLog {
    /// Open or create the log
    ///
    /// A last line without its newline is a write torn by a crash; it was
    /// never acknowledged and is cut off before appending resumes.
    pub fn open(config: &AuditConfig) -> Result<Self> {
        if let Some(parent) = config.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_path)?;

        let genesis = genesis_hash(&config.genesis_seed);
        let tail = Self::scan_tail(&config.log_path, &genesis)?;

        if let Some(torn_at) = tail.torn_at {
            let size = file.size()?;
            file.set_len(torn_at)?;
            file.sync_data()?;
            tracing::warn!(
                path = ?config.log_path,
                dropped_bytes = size - torn_at,
                "Dropped torn audit entry"
            );
        }

        tracing::info!(
            path = ?config.log_path,
            entries = tail.len,
            "Opened audit log"
        );

        Ok(Self {
            path: config.log_path.clone(),
            genesis,
            state: Mutex::new(AuditState {
                file,
                head: tail.head,
                len: tail.len,
                damaged: false,
            }),
        })
    }

    /// Head hash, entry count and torn-tail offset of the existing file
    ///
    /// An unparsable line leaves the head at the last readable entry;
    /// verification reports the break.
    fn scan_tail(path: &Path, genesis: &str) -> Result<Tail> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut tail = Tail {
            head: genesis.to_string(),
            len: 0,
            torn_at: None,
        };
        let mut offset = 0u64;
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                break;
            }
            if line.last() != Some(&b'\n') {
                tail.torn_at = Some(offset);
                break;
            }
            offset += read as u64;
            if is_blank(&line) {
                continue;
            }
            tail.len += 1;
            if let Ok(entry) = serde_json::from_slice::<AuditEntry>(&line) {
                tail.head = entry.hash;
            }
        }

        Ok(tail)
    }

    fn lines(&self) -> Result<impl Iterator<Item = io::Result<Vec<u8>>>> {
        Ok(BufReader::new(File::open(&self.path)?).split(b'\n'))
    }

    /// Genesis hash for this deployment
    pub fn genesis(&self) -> &str {
        &self.genesis
    }

    /// Hash of the latest entry
    pub fn head(&self) -> String {
        self.state.lock().head.clone()
    }

    /// Number of entries
    pub fn len(&self) -> u64 {
        self.state.lock().len
    }

    /// Whether no entry was ever appended
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enter the single-writer section
    pub fn begin(&self) -> AuditWriter<'_> {
        AuditWriter {
            state: self.state.lock(),
        }
    }

    /// Enter the single-writer section, waiting at most `timeout`
    pub fn begin_within(&self, timeout: Duration) -> Result<AuditWriter<'_>> {
        let state = self.state.try_lock_for(timeout).ok_or_else(|| {
            Error::Timeout(format!(
                "Audit writer not acquired within {}ms",
                timeout.as_millis()
            ))
        })?;
        Ok(AuditWriter { state })
    }

    /// Append one event outside a larger commit
    pub fn append(&self, event: AuditEvent) -> Result<AuditEntry> {
        self.begin().append(event)
    }

    /// Replay the chain; `false` if any link or hash is wrong
    pub fn verify(&self) -> Result<bool> {
        Ok(self.verify_report()?.is_intact())
    }

    /// Replay the chain and report the first broken entry
    pub fn verify_report(&self) -> Result<VerifyReport> {
        self.verify_against(None)
    }

    /// Replay the chain, also requiring the entry an anchor points at
    ///
    /// Besides link and hash checks, the file must end exactly at the head
    /// this process appended. Missing trailing entries are reported at the
    /// first missing index. A clean replay clears the damaged flag.
    pub fn verify_against(&self, anchor: Option<&AuditAnchor>) -> Result<VerifyReport> {
        // Hold the writer lock so the file is not appended mid-scan
        let mut state = self.state.lock();

        let mut expected_prev = self.genesis.clone();
        let mut entries = 0u64;
        let mut first_broken = None;

        for line in self.lines()? {
            let line = line?;
            if is_blank(&line) {
                continue;
            }
            let index = entries;
            entries += 1;
            if first_broken.is_some() {
                continue;
            }

            match serde_json::from_slice::<AuditEntry>(&line) {
                Ok(entry) if entry.prev_hash == expected_prev && entry.verify_hash() => {
                    let anchored = anchor.map_or(true, |a| a.len != index + 1 || a.hash == entry.hash);
                    if anchored {
                        expected_prev = entry.hash;
                    } else {
                        first_broken = Some(index);
                    }
                }
                _ => first_broken = Some(index),
            }
        }

        if first_broken.is_none() {
            if entries != state.len {
                first_broken = Some(entries.min(state.len));
            } else if expected_prev != state.head {
                first_broken = Some(entries.saturating_sub(1));
            } else if let Some(anchor) = anchor.filter(|a| a.len > entries) {
                tracing::error!(
                    entries,
                    anchored_len = anchor.len,
                    "Audit log is behind committed state"
                );
                first_broken = Some(entries);
            }
        }

        if first_broken.is_none() && state.damaged {
            tracing::info!(entries, "Audit log consistent again after failed append");
            state.damaged = false;
        }

        Ok(VerifyReport {
            entries,
            first_broken,
        })
    }

    /// All entries in append order
    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        self.search(&AuditFilter::default())
    }

    /// Entries matching a filter, in append order
    ///
    /// Unreadable lines are skipped and logged so a damaged trail can still
    /// be listed; [`AuditLog::verify_report`] reports them as breaks.
    pub fn search(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let mut results = Vec::new();
        let mut index = 0u64;
        let mut skipped = 0u64;

        for line in self.lines()? {
            let line = line?;
            if is_blank(&line) {
                continue;
            }
            match serde_json::from_slice::<AuditEntry>(&line) {
                Ok(entry) if filter.matches(&entry) => results.push(entry),
                Ok(_) => {}
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(index, error = %e, "Skipping unreadable audit entry");
                }
            }
            index += 1;
        }

        if skipped > 0 {
            tracing::warn!(skipped, "Audit search skipped unreadable entries");
        }

        Ok(results)
    }
}

struct Tail {
    head: String,
    len: u64,
    torn_at: Option<u64>,
}

/// Exclusive append access to the chain
pub struct AuditWriter<'a> {
    state: MutexGuard<'a, AuditState>,
}

impl std::fmt::Debug for AuditWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditWriter")
            .field("head", &self.state.head)
            .field("len", &self.state.len)
            .finish()
    }
}

impl AuditWriter<'_> {
    /// Hash the next entry will link to
    pub fn head(&self) -> &str {
        &self.state.head
    }

    /// Anchor for the latest appended entry
    pub fn anchor(&self) -> AuditAnchor {
        AuditAnchor {
            len: self.state.len,
            hash: self.state.head.clone(),
        }
    }

    /// Seal, write and fsync one entry
    ///
    /// A failed write is cut back out of the file and surfaces as
    /// [`Error::Io`]. If that cut also fails the log is marked damaged: this
    /// and every later append return [`Error::AuditChainBroken`] until a
    /// replay finds the file consistent again.
    pub fn append(&mut self, event: AuditEvent) -> Result<AuditEntry> {
        if self.state.damaged {
            return Err(Error::AuditChainBroken {
                index: self.state.len,
            });
        }

        let mut entry = AuditEntry {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            actor_id: event.actor_id,
            action_type: event.action,
            details_text: event.details,
            prev_hash: self.state.head.clone(),
            hash: String::new(),
        };
        entry.hash = entry.compute_hash()?;

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        match append_line(&mut self.state.file, line.as_bytes()) {
            Ok(()) => {}
            Err(AppendFailure::RolledBack(cause)) => {
                tracing::warn!(error = %cause, "Audit append failed and was rolled back");
                return Err(Error::Io(cause));
            }
            Err(AppendFailure::Damaged { cause, rollback }) => {
                self.state.damaged = true;
                tracing::error!(
                    error = %cause,
                    rollback_error = %rollback,
                    index = self.state.len,
                    "Audit append failed and could not be rolled back"
                );
                return Err(Error::AuditChainBroken {
                    index: self.state.len,
                });
            }
        }

        self.state.head = entry.hash.clone();
        self.state.len += 1;

        tracing::debug!(
            action = %entry.action_type,
            actor_id = %entry.actor_id,
            hash = %entry.hash,
            "Audit entry appended"
        );

        Ok(entry)
    }
}

/// Genesis hash for a deployment seed
pub fn genesis_hash(seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(GENESIS_PREFIX.as_bytes());
    hasher.update(seed.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_log(dir: &Path) -> AuditLog {
        let config = AuditConfig {
            log_path: dir.join("audit").join("audit.log"),
            genesis_seed: "test-seed".to_string(),
            verify_on_open: true,
        };
        AuditLog::open(&config).unwrap()
    }

    fn event(i: usize) -> AuditEvent {
        AuditEvent::new(
            format!("citizen-{}", i),
            AuditAction::PaymentCompleted,
            format!("Payment {} to V001", i),
        )
    }

    #[test]
    fn test_first_entry_links_to_genesis() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());

        let entry = log.append(event(0)).unwrap();
        assert_eq!(entry.prev_hash, genesis_hash("test-seed"));
        assert!(entry.verify_hash());
        assert_eq!(log.head(), entry.hash);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_hash_chain_verifies() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());

        for i in 0..5 {
            log.append(event(i)).unwrap();
        }

        let report = log.verify_report().unwrap();
        assert_eq!(report.entries, 5);
        assert!(report.is_intact());
        assert!(log.verify().unwrap());
    }

    #[test]
    fn test_reopen_continues_chain() {
        let dir = tempdir().unwrap();
        let head = {
            let log = open_log(dir.path());
            log.append(event(0)).unwrap();
            log.append(event(1)).unwrap().hash
        };

        let log = open_log(dir.path());
        assert_eq!(log.head(), head);
        assert_eq!(log.len(), 2);

        let next = log.append(event(2)).unwrap();
        assert_eq!(next.prev_hash, head);
        assert!(log.verify().unwrap());
    }

    #[test]
    fn test_tampered_details_detected() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        for i in 0..3 {
            log.append(event(i)).unwrap();
        }

        let path = dir.path().join("audit").join("audit.log");
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("Payment 1 to V001", "Payment 9 to V001")).unwrap();

        let report = log.verify_report().unwrap();
        assert_eq!(report.first_broken, Some(1));
        assert!(!log.verify().unwrap());
    }

    #[test]
    fn test_removed_entry_detected() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        for i in 0..3 {
            log.append(event(i)).unwrap();
        }

        let path = dir.path().join("audit").join("audit.log");
        let content = std::fs::read_to_string(&path).unwrap();
        let kept: Vec<&str> = content.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect();
        std::fs::write(&path, kept.join("\n") + "\n").unwrap();

        assert_eq!(log.verify_report().unwrap().first_broken, Some(1));
    }

    #[test]
    fn test_unparsable_line_counts_as_broken() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        log.append(event(0)).unwrap();

        let path = dir.path().join("audit").join("audit.log");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();

        assert_eq!(log.verify_report().unwrap().first_broken, Some(1));
    }

    fn log_path(dir: &Path) -> PathBuf {
        dir.join("audit").join("audit.log")
    }

    fn keep_lines(path: &Path, keep: usize) {
        let content = std::fs::read_to_string(path).unwrap();
        let kept: Vec<&str> = content.lines().take(keep).collect();
        std::fs::write(path, kept.join("\n") + "\n").unwrap();
    }

    #[test]
    fn test_truncated_tail_detected() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        for i in 0..3 {
            log.append(event(i)).unwrap();
        }

        keep_lines(&log_path(dir.path()), 2);

        let report = log.verify_report().unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(report.first_broken, Some(2));
        assert!(!log.verify().unwrap());
    }

    #[test]
    fn test_anchor_detects_truncation_across_reopen() {
        let dir = tempdir().unwrap();
        let anchor = {
            let log = open_log(dir.path());
            let mut writer = log.begin();
            for i in 0..3 {
                writer.append(event(i)).unwrap();
            }
            writer.anchor()
        };
        assert_eq!(anchor.len, 3);

        keep_lines(&log_path(dir.path()), 2);

        // The reopened log agrees with itself, only the anchor shows the loss
        let log = open_log(dir.path());
        assert!(log.verify_report().unwrap().is_intact());
        assert_eq!(log.verify_against(Some(&anchor)).unwrap().first_broken, Some(2));
    }

    #[test]
    fn test_anchor_must_match_entry_hash() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        log.append(event(0)).unwrap();
        let second = log.append(event(1)).unwrap();

        let good = AuditAnchor { len: 2, hash: second.hash };
        assert!(log.verify_against(Some(&good)).unwrap().is_intact());

        let forged = AuditAnchor { len: 1, hash: "00".repeat(32) };
        assert_eq!(log.verify_against(Some(&forged)).unwrap().first_broken, Some(0));
    }

    #[test]
    fn test_torn_tail_dropped_on_open() {
        let dir = tempdir().unwrap();
        let head = {
            let log = open_log(dir.path());
            log.append(event(0)).unwrap();
            log.append(event(1)).unwrap().hash
        };

        let path = log_path(dir.path());
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"id\":\"0190").unwrap();
        drop(file);

        let log = open_log(dir.path());
        assert_eq!(log.len(), 2);
        assert_eq!(log.head(), head);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));

        let next = log.append(event(2)).unwrap();
        assert_eq!(next.prev_hash, head);
        assert!(log.verify().unwrap());
    }

    /// In-memory log file that accepts a limited number of bytes
    struct ShortFile {
        data: Vec<u8>,
        accept: usize,
        truncate_fails: bool,
    }

    impl Write for ShortFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.accept == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = buf.len().min(self.accept);
            self.data.extend_from_slice(&buf[..n]);
            self.accept -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogFile for ShortFile {
        fn size(&self) -> io::Result<u64> {
            Ok(self.data.len() as u64)
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            if self.truncate_fails {
                return Err(io::Error::new(io::ErrorKind::Other, "read-only file system"));
            }
            self.data.truncate(len as usize);
            Ok(())
        }

        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_partial_write_rolled_back() {
        let mut file = ShortFile {
            data: b"entry-0\n".to_vec(),
            accept: 4,
            truncate_fails: false,
        };

        let err = append_line(&mut file, b"entry-1\n").unwrap_err();
        assert!(matches!(err, AppendFailure::RolledBack(_)));
        assert_eq!(file.data, b"entry-0\n");
    }

    #[test]
    fn test_partial_write_without_rollback_is_damage() {
        let mut file = ShortFile {
            data: b"entry-0\n".to_vec(),
            accept: 4,
            truncate_fails: true,
        };

        let err = append_line(&mut file, b"entry-1\n").unwrap_err();
        assert!(matches!(err, AppendFailure::Damaged { .. }));
        assert_eq!(file.data, b"entry-0\nentr");
    }

    #[test]
    fn test_damaged_log_refuses_appends_until_consistent() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        let first = log.append(event(0)).unwrap();
        let path = log_path(dir.path());

        // A read-only handle fails both the write and the rollback
        log.state.lock().file = File::open(&path).unwrap();
        assert!(matches!(
            log.append(event(1)),
            Err(Error::AuditChainBroken { index: 1 })
        ));

        log.state.lock().file = OpenOptions::new().append(true).open(&path).unwrap();
        assert!(matches!(
            log.append(event(1)),
            Err(Error::AuditChainBroken { index: 1 })
        ));

        // Nothing reached the file, so a replay clears the damage
        assert!(log.verify().unwrap());
        let next = log.append(event(1)).unwrap();
        assert_eq!(next.prev_hash, first.hash);
        assert!(log.verify().unwrap());
    }

    #[test]
    fn test_begin_within_times_out() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());

        let _held = log.begin();
        let err = log.begin_within(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_search_skips_unreadable_lines() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        for i in 0..3 {
            log.append(event(i)).unwrap();
        }

        let path = log_path(dir.path());
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        let mangled = format!("{}\n{}\n{}\n", lines[0], &lines[1][..20], lines[2]);
        std::fs::write(&path, mangled).unwrap();

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].actor_id, "citizen-0");
        assert_eq!(entries[1].actor_id, "citizen-2");
        assert_eq!(log.verify_report().unwrap().first_broken, Some(1));
    }

    #[test]
    fn test_search_filters() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());

        log.append(event(0)).unwrap();
        log.append(event(1)).unwrap();
        log.append(AuditEvent::new(
            "officer-4521",
            AuditAction::SubsidyIssued,
            "Issued Food Support",
        ))
        .unwrap();

        let by_actor = log
            .search(&AuditFilter {
                actor_id: Some("citizen-1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_actor.len(), 1);

        let by_action = log
            .search(&AuditFilter {
                action: Some(AuditAction::PaymentCompleted),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_action.len(), 2);

        assert_eq!(log.entries().unwrap().len(), 3);
    }

    #[test]
    fn test_persisted_form_uses_camel_case() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        log.append(event(0)).unwrap();

        let path = dir.path().join("audit").join("audit.log");
        let line = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        for field in ["id", "timestamp", "actorId", "actionType", "detailsText", "prevHash", "hash"] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(value["actionType"], "payment_completed");
    }
}
