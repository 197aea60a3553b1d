//! Version Manager — bounded, ordered history of immutable snapshots.
//!
//! Snapshots compress the full document content with LZ4 (block mode,
//! prepend-size) and carry an FNV checksum so integrity survives an outer
//! persistence layer. Snapshots are taken explicitly or automatically
//! after N applied operations / T elapsed time (both triggers enabled by
//! default).
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │              VersionStore                   │
//! │                                            │
//! │  [ v1 | v2* | v3 | ... | vN ]   *=tagged   │
//! │                                            │
//! │  prune: oldest untagged beyond max_versions│
//! │  tagged versions retained indefinitely     │
//! └────────────────────────────────────────────┘
//! ```
//!
//! The Version Manager only reads the Document Store; rollback goes back
//! through the Session Coordinator as an ordinary conflict-checkable
//! operation.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::document::{content_checksum, split_lines, DocumentStore, Position};
use crate::error::EngineError;
use crate::operation::{now_millis, OpKind, Operation};

// ───────────────────────────────────────────────────────────────────
// Compressed snapshot content
// ───────────────────────────────────────────────────────────────────

/// LZ4-compressed document content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedContent {
    /// Original uncompressed size in bytes.
    pub original_size: u32,
    /// LZ4 block-compressed payload (size-prepended).
    pub compressed: Vec<u8>,
}

impl CompressedContent {
    pub fn compress(content: &str) -> Self {
        let bytes = content.as_bytes();
        Self {
            original_size: bytes.len() as u32,
            compressed: lz4_flex::compress_prepend_size(bytes),
        }
    }

    pub fn decompress(&self) -> Result<String, EngineError> {
        let bytes = lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| EngineError::EncodingError(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| EngineError::EncodingError(e.to_string()))
    }

    /// Compression ratio (original / compressed).
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed.is_empty() {
            return 0.0;
        }
        self.original_size as f64 / self.compressed.len() as f64
    }
}

// ───────────────────────────────────────────────────────────────────
// Versions
// ───────────────────────────────────────────────────────────────────

/// An immutable snapshot of a project document at one revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub id: Uuid,
    pub project_id: Uuid,
    pub revision: u64,
    content: CompressedContent,
    /// FNV checksum of the uncompressed content.
    pub checksum: u32,
    pub created_at_ms: u64,
    pub author: Uuid,
    pub tags: Vec<String>,
}

impl Version {
    fn capture(doc: &DocumentStore, author: Uuid, tags: Vec<String>) -> Self {
        let content = doc.content();
        Self {
            id: Uuid::new_v4(),
            project_id: doc.project_id(),
            revision: doc.revision(),
            checksum: content_checksum(&content),
            content: CompressedContent::compress(&content),
            created_at_ms: now_millis(),
            author,
            tags,
        }
    }

    /// Decompressed snapshot content.
    pub fn content(&self) -> Result<String, EngineError> {
        let content = self.content.decompress()?;
        if content_checksum(&content) != self.checksum {
            return Err(EngineError::EncodingError(format!(
                "version {} content checksum mismatch",
                self.id
            )));
        }
        Ok(content)
    }

    pub fn is_tagged(&self) -> bool {
        !self.tags.is_empty()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// One line-level difference between two versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionChange {
    pub line: u32,
    pub change: ChangeKind,
    pub old_line: Option<String>,
    pub new_line: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

/// Line-level diff between two versions. Pure; no mutation.
pub fn diff(from: &Version, to: &Version) -> Result<Vec<VersionChange>, EngineError> {
    let old_lines = split_lines(&from.content()?);
    let new_lines = split_lines(&to.content()?);
    let mut changes = Vec::new();

    let common = old_lines.len().min(new_lines.len());
    for i in 0..common {
        if old_lines[i] != new_lines[i] {
            changes.push(VersionChange {
                line: i as u32,
                change: ChangeKind::Modified,
                old_line: Some(old_lines[i].clone()),
                new_line: Some(new_lines[i].clone()),
            });
        }
    }
    for (i, line) in old_lines.iter().enumerate().skip(common) {
        changes.push(VersionChange {
            line: i as u32,
            change: ChangeKind::Removed,
            old_line: Some(line.clone()),
            new_line: None,
        });
    }
    for (i, line) in new_lines.iter().enumerate().skip(common) {
        changes.push(VersionChange {
            line: i as u32,
            change: ChangeKind::Added,
            old_line: None,
            new_line: Some(line.clone()),
        });
    }
    Ok(changes)
}

// ───────────────────────────────────────────────────────────────────
// Snapshot policy & store
// ───────────────────────────────────────────────────────────────────

/// Automatic snapshot triggers and retention bounds.
#[derive(Debug, Clone)]
pub struct VersionPolicy {
    /// Retained version count; oldest untagged pruned beyond this.
    pub max_versions: usize,
    /// Snapshot after this many applied operations (None = disabled).
    pub snapshot_every_ops: Option<u64>,
    /// Snapshot after this much elapsed time (None = disabled).
    pub snapshot_interval: Option<Duration>,
}

impl Default for VersionPolicy {
    fn default() -> Self {
        Self {
            max_versions: 50,
            snapshot_every_ops: Some(50),
            snapshot_interval: Some(Duration::from_secs(300)),
        }
    }
}

impl VersionPolicy {
    /// Policy for testing (small counts, no timer).
    pub fn for_testing() -> Self {
        Self {
            max_versions: 10,
            snapshot_every_ops: Some(5),
            snapshot_interval: None,
        }
    }
}

/// Append-only version table for one project.
pub struct VersionStore {
    project_id: Uuid,
    versions: Vec<Version>,
    policy: VersionPolicy,
    ops_since_snapshot: u64,
    last_snapshot: Instant,
}

impl VersionStore {
    pub fn new(project_id: Uuid, policy: VersionPolicy) -> Self {
        Self {
            project_id,
            versions: Vec::new(),
            policy,
            ops_since_snapshot: 0,
            last_snapshot: Instant::now(),
        }
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Take a snapshot of the document at its current revision.
    pub fn snapshot(&mut self, doc: &DocumentStore, author: Uuid, tags: Vec<String>) -> Version {
        let version = Version::capture(doc, author, tags);
        log::info!(
            "Snapshot {} of project {} at revision {} ({} tags)",
            version.id,
            self.project_id,
            version.revision,
            version.tags.len()
        );
        self.versions.push(version.clone());
        self.ops_since_snapshot = 0;
        self.last_snapshot = Instant::now();
        self.prune();
        version
    }

    /// Record one applied operation and snapshot if a policy trigger fires.
    pub fn record_applied(&mut self, doc: &DocumentStore, author: Uuid) -> Option<Version> {
        self.ops_since_snapshot += 1;

        let ops_due = self
            .policy
            .snapshot_every_ops
            .map(|n| self.ops_since_snapshot >= n)
            .unwrap_or(false);
        let time_due = self
            .policy
            .snapshot_interval
            .map(|t| self.last_snapshot.elapsed() >= t)
            .unwrap_or(false);

        if ops_due || time_due {
            Some(self.snapshot(doc, author, Vec::new()))
        } else {
            None
        }
    }

    /// Look up a version by id.
    pub fn get(&self, version_id: Uuid) -> Result<&Version, EngineError> {
        self.versions
            .iter()
            .find(|v| v.id == version_id)
            .ok_or(EngineError::VersionNotFound { version_id })
    }

    /// Most recent version, if any.
    pub fn latest(&self) -> Option<&Version> {
        self.versions.last()
    }

    /// All retained versions, oldest first.
    pub fn list(&self) -> &[Version] {
        &self.versions
    }

    /// Drop oldest untagged versions beyond `max_versions`.
    /// Tagged versions are retained indefinitely.
    fn prune(&mut self) {
        while self.versions.len() > self.policy.max_versions {
            let victim = self
                .versions
                .iter()
                .position(|v| !v.is_tagged());
            match victim {
                Some(idx) => {
                    let pruned = self.versions.remove(idx);
                    log::debug!(
                        "Pruned untagged version {} (revision {})",
                        pruned.id,
                        pruned.revision
                    );
                }
                None => break, // everything tagged: retain all
            }
        }
    }

    /// Synthesize the rollback operation for a target version.
    ///
    /// The result is a whole-document replace based at the current
    /// revision; it goes through the normal submission path and is
    /// conflict-checkable like any other operation.
    pub fn rollback_operation(
        &self,
        version_id: Uuid,
        current_revision: u64,
        author: Uuid,
    ) -> Result<Operation, EngineError> {
        let version = self.get(version_id)?;
        let content = version.content()?;
        Ok(Operation::new(
            author,
            OpKind::Replace { length: None, text: content },
            Position::new(0, 0),
            current_revision,
        ))
    }
}
