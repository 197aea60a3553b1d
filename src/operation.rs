//! Operation model and the append-only, per-project Operation Log.
//!
//! Every accepted edit is stamped with a monotonically increasing project
//! revision and stored as an *effective* (already rebased) operation, so a
//! replay from revision 0 reproduces the document without re-running any
//! transformation.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │               OperationLog                     │
//! │                                               │
//! │  horizon ──► [ r5 | r6 | r7 | ... | head ]    │
//! │  (pruned)      checksummed LogEntry each      │
//! │                                               │
//! │  base_revision < horizon  ⇒  StaleBaseRevision│
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Entries encode with bincode and carry an FNV checksum so an outer
//! persistence layer can store and recover them with integrity checks.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::document::Position;
use crate::error::EngineError;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The edit payload of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert text within a line. Text must not contain a newline.
    Insert { text: String },
    /// Delete `length` characters at the position; `None` deletes the
    /// whole line.
    Delete { length: Option<u32> },
    /// Replace `length` characters with `text`; `None` (anchored at 0:0)
    /// replaces the entire document — the rollback path.
    Replace { length: Option<u32>, text: String },
    /// Content-neutral formatting annotation over a character range.
    Format { length: u32, style: String },
}

impl OpKind {
    /// Short tag for logging and audit records.
    pub fn tag(&self) -> &'static str {
        match self {
            OpKind::Insert { .. } => "insert",
            OpKind::Delete { .. } => "delete",
            OpKind::Replace { .. } => "replace",
            OpKind::Format { .. } => "format",
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, OpKind::Insert { .. })
    }

    /// Whole-document replace (rollback) — intersects everything.
    pub fn is_document_replace(&self) -> bool {
        matches!(self, OpKind::Replace { length: None, .. })
    }
}

/// A single edit submitted by a participant.
///
/// Immutable once created. `base_revision` is the document revision the
/// author last observed — the causality anchor for conflict detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub author_id: Uuid,
    pub kind: OpKind,
    pub position: Position,
    pub base_revision: u64,
    /// Author-side wall clock, used for deterministic precedence.
    pub timestamp_ms: u64,
}

impl Operation {
    /// Create an operation stamped with the current wall clock.
    pub fn new(author_id: Uuid, kind: OpKind, position: Position, base_revision: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            author_id,
            kind,
            position,
            base_revision,
            timestamp_ms: now_millis(),
        }
    }

    /// Create with an explicit timestamp (deterministic precedence tests).
    pub fn with_timestamp(
        author_id: Uuid,
        kind: OpKind,
        position: Position,
        base_revision: u64,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            author_id,
            kind,
            position,
            base_revision,
            timestamp_ms,
        }
    }

    /// Total order used everywhere concurrent operations need a
    /// deterministic winner: later timestamp wins, author id breaks ties.
    pub fn order_key(&self) -> (u64, Uuid) {
        (self.timestamp_ms, self.author_id)
    }
}

/// An accepted operation stamped with its final revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Revision assigned when the operation was materialized.
    pub revision: u64,
    /// The effective (rebased) operation.
    pub operation: Operation,
    /// FNV checksum over revision + encoded operation.
    pub checksum: u32,
}

impl LogEntry {
    /// Create an entry with a computed checksum.
    pub fn new(revision: u64, operation: Operation) -> Self {
        let checksum = Self::compute_checksum(revision, &operation);
        Self {
            revision,
            operation,
            checksum,
        }
    }

    /// Verify the entry's checksum.
    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(self.revision, &self.operation)
    }

    fn compute_checksum(revision: u64, operation: &Operation) -> u32 {
        let encoded =
            bincode::serde::encode_to_vec(operation, bincode::config::standard())
                .unwrap_or_default();
        let mut hash: u32 = 0x811c_9dc5; // FNV offset basis
        for byte in revision.to_le_bytes().iter().chain(encoded.iter()) {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193); // FNV prime
        }
        hash
    }

    /// Serialize to bytes for an outer persistence layer.
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| EngineError::EncodingError(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        let (entry, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| EngineError::EncodingError(e.to_string()))?;
        Ok(entry)
    }
}

/// Operation log configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Maximum retained entries before the oldest are pruned
    /// (advancing the staleness horizon). Default: 10,000.
    pub max_entries: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

impl LogConfig {
    /// Config for testing (tiny retention so pruning is easy to trigger).
    pub fn for_testing() -> Self {
        Self { max_entries: 8 }
    }
}

/// Append-only record of accepted operations for one project.
///
/// Revisions are assigned here and are gapless: entry `n` always follows
/// entry `n - 1`. Pruned revisions move the `horizon` forward; operations
/// based below the horizon can no longer be conflict-checked and are
/// rejected with `StaleBaseRevision`.
#[derive(Debug, Clone)]
pub struct OperationLog {
    entries: VecDeque<LogEntry>,
    /// Highest pruned revision. Entries cover `(horizon, head]`.
    horizon: u64,
    /// Last assigned revision (0 = nothing applied yet).
    head: u64,
    config: LogConfig,
}

impl OperationLog {
    pub fn new(config: LogConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            horizon: 0,
            head: 0,
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(LogConfig::default())
    }

    /// Resume from a recovered head/horizon (resync path).
    pub fn from_head(config: LogConfig, head: u64) -> Self {
        let mut log = Self::new(config);
        log.head = head;
        log.horizon = head;
        log
    }

    /// Append an accepted operation, assigning the next revision.
    pub fn append(&mut self, operation: Operation) -> LogEntry {
        self.head += 1;
        let entry = LogEntry::new(self.head, operation);
        self.entries.push_back(entry.clone());

        while self.entries.len() > self.config.max_entries {
            if let Some(old) = self.entries.pop_front() {
                self.horizon = old.revision;
                log::debug!("Operation log pruned through revision {}", old.revision);
            }
        }
        entry
    }

    /// Last assigned revision.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Highest pruned revision; bases below this are stale.
    pub fn horizon(&self) -> u64 {
        self.horizon
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries the author of an operation based at `base_revision` has not
    /// observed, in revision order.
    ///
    /// Fails with `StaleBaseRevision` if the base predates the pruning
    /// horizon and with `RevisionAhead` if it is newer than the head.
    pub fn unseen_since(&self, base_revision: u64) -> Result<Vec<&LogEntry>, EngineError> {
        if base_revision < self.horizon {
            return Err(EngineError::StaleBaseRevision {
                base: base_revision,
                horizon: self.horizon,
            });
        }
        if base_revision > self.head {
            return Err(EngineError::RevisionAhead {
                base: base_revision,
                head: self.head,
            });
        }
        Ok(self
            .entries
            .iter()
            .filter(|e| e.revision > base_revision)
            .collect())
    }

    /// Look up the applied entry for an operation id.
    pub fn find_operation(&self, operation_id: Uuid) -> Option<&LogEntry> {
        self.entries.iter().find(|e| e.operation.id == operation_id)
    }

    /// All retained entries in revision order.
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Retained entries with `revision <= upto`, for partial replay.
    pub fn entries_through(&self, upto: u64) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.revision <= upto)
            .cloned()
            .collect()
    }

    /// Drop entries with `revision <= revision`, advancing the horizon.
    ///
    /// Typically called after a snapshot makes the prefix reproducible
    /// from the version store instead.
    pub fn prune_through(&mut self, revision: u64) -> usize {
        let before = self.entries.len();
        while let Some(front) = self.entries.front() {
            if front.revision > revision {
                break;
            }
            self.horizon = front.revision;
            self.entries.pop_front();
        }
        let pruned = before - self.entries.len();
        if pruned > 0 {
            log::info!("Pruned {pruned} log entries through revision {}", self.horizon);
        }
        pruned
    }

    /// Recover entries from serialized bytes, skipping corrupted ones.
    ///
    /// Returns valid entries sorted by revision and the corrupt count.
    pub fn recover_entries(serialized: &[Vec<u8>]) -> (Vec<LogEntry>, usize) {
        let mut valid = Vec::with_capacity(serialized.len());
        let mut corrupted = 0;

        for bytes in serialized {
            match LogEntry::decode(bytes) {
                Ok(entry) if entry.verify() => valid.push(entry),
                _ => corrupted += 1,
            }
        }
        valid.sort_by_key(|e| e.revision);
        (valid, corrupted)
    }
}
