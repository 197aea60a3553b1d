//! Conflict detection and resolution with OT-style position rebasing.
//!
//! Detection is a pure function over the operations an author had not yet
//! observed (`revision > base_revision`): two edits conflict when their
//! affected ranges intersect — same line with overlapping column spans
//! (within a configurable proximity window), a whole-line delete touching
//! the other's line, or a whole-document replace touching anything.
//!
//! Insert/insert pairs never conflict: both are zero-width, so they are
//! ordered deterministically by `(timestamp, author_id)` and the later one
//! is shifted past the earlier one's inserted length.
//!
//! ```text
//! submit(op) ──► unseen = log.unseen_since(op.base_revision)
//!                    │
//!         ┌──────────┴───────────┐
//!         ▼                      ▼
//!   no intersection        intersection
//!   rebase(op, unseen)     Conflict { Pending | auto-resolved }
//!   apply + append         precedence: later (ts, author) wins
//! ```

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::document::{DocumentStore, Position};
use crate::operation::{now_millis, LogEntry, OpKind, Operation};

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

/// Workspace-level conflict handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Deterministic merge: proximity-only conflicts keep both sides;
    /// true overlaps resolve by `(timestamp, author_id)` precedence.
    Auto,
    /// Conflicts stay pending until explicitly resolved; stale ones
    /// degrade to `Auto` behavior after the staleness window.
    Manual,
    /// As `Manual`, plus a precomputed candidate merge for the callers.
    Suggestions,
}

/// Conflict detection/resolution configuration.
#[derive(Debug, Clone)]
pub struct ConflictConfig {
    pub policy: ConflictPolicy,
    /// Column distance within which non-overlapping ranges on the same
    /// line are still treated as conflicting. Default: 0 (exact overlap).
    pub proximity_window: u32,
    /// Age after which a pending manual conflict degrades to auto
    /// resolution. Guarantees liveness — no conflict pends forever.
    pub staleness_window: Duration,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            policy: ConflictPolicy::Auto,
            proximity_window: 0,
            staleness_window: Duration::from_secs(300),
        }
    }
}

impl ConflictConfig {
    /// Config for testing (manual policy, tiny staleness window).
    pub fn for_testing() -> Self {
        Self {
            policy: ConflictPolicy::Manual,
            proximity_window: 0,
            staleness_window: Duration::from_millis(50),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Affected ranges
// ───────────────────────────────────────────────────────────────────

/// The range of content an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Span {
    /// Closed character interval `[start, end]` on one line.
    /// Inserts are zero-width points (`start == end`).
    Columns { line: u32, start: u32, end: u32 },
    /// An entire line (whole-line delete).
    Line { line: u32 },
    /// The whole document (rollback replace).
    Document,
}

/// Compute the affected range of an operation.
pub fn affected_span(op: &Operation) -> Span {
    let Position { line, column } = op.position;
    match &op.kind {
        OpKind::Insert { .. } => Span::Columns { line, start: column, end: column },
        OpKind::Delete { length: Some(n) } => Span::Columns {
            line,
            start: column,
            end: column + n.saturating_sub(1),
        },
        OpKind::Delete { length: None } => Span::Line { line },
        OpKind::Replace { length: Some(n), .. } => Span::Columns {
            line,
            start: column,
            end: column + n.saturating_sub(1),
        },
        OpKind::Replace { length: None, .. } => Span::Document,
        OpKind::Format { length, .. } => Span::Columns {
            line,
            start: column,
            end: column + length.saturating_sub(1),
        },
    }
}

/// Whether two spans intersect, widened by the proximity window.
pub fn spans_intersect(a: Span, b: Span, window: u32) -> bool {
    match (a, b) {
        (Span::Document, _) | (_, Span::Document) => true,
        (Span::Line { line: la }, Span::Line { line: lb }) => la == lb,
        (Span::Line { line: la }, Span::Columns { line: lb, .. })
        | (Span::Columns { line: la, .. }, Span::Line { line: lb }) => la == lb,
        (
            Span::Columns { line: la, start: sa, end: ea },
            Span::Columns { line: lb, start: sb, end: eb },
        ) => la == lb && sa.saturating_sub(window) <= eb && sb.saturating_sub(window) <= ea,
    }
}

// ───────────────────────────────────────────────────────────────────
// Detection
// ───────────────────────────────────────────────────────────────────

/// Result of detection: the unseen operations the submission collides
/// with, and whether any collision is a true character overlap (as
/// opposed to a proximity-window hit).
#[derive(Debug, Clone)]
pub struct ConflictCandidate {
    pub intersecting: Vec<Operation>,
    pub spatial_overlap: bool,
}

/// Pure conflict check of a submission against the unseen log suffix.
///
/// Returns `None` when the operation is uncontested (possibly after
/// rebasing) and may auto-apply.
pub fn detect(op: &Operation, unseen: &[&LogEntry], window: u32) -> Option<ConflictCandidate> {
    let span = affected_span(op);
    let mut intersecting = Vec::new();
    let mut spatial_overlap = false;

    for entry in unseen {
        let other = &entry.operation;
        // Concurrent insertions commute via position rebasing.
        if op.kind.is_insert() && other.kind.is_insert() {
            continue;
        }
        let other_span = affected_span(other);
        if spans_intersect(span, other_span, window) {
            if spans_intersect(span, other_span, 0) {
                spatial_overlap = true;
            }
            intersecting.push(other.clone());
        }
    }

    if intersecting.is_empty() {
        None
    } else {
        Some(ConflictCandidate { intersecting, spatial_overlap })
    }
}

// ───────────────────────────────────────────────────────────────────
// Position rebasing (operational transform)
// ───────────────────────────────────────────────────────────────────

/// Rebase a non-conflicting operation over the unseen log suffix.
///
/// Each prior effective operation shifts the submission's position the way
/// its materialization moved the surrounding content. Only applies to
/// operations `detect` cleared — overlapping ranges never reach here.
pub fn rebase(op: &Operation, unseen: &[&LogEntry]) -> Operation {
    let mut rebased = op.clone();
    for entry in unseen {
        transform_against(&mut rebased, &entry.operation);
    }
    rebased
}

/// Shift `op`'s position past one previously applied operation.
fn transform_against(op: &mut Operation, prior: &Operation) {
    let p = prior.position;
    match &prior.kind {
        OpKind::Insert { text } => {
            if p.line != op.position.line {
                return;
            }
            let len = text.chars().count() as u32;
            let shift = if op.kind.is_insert() && p.column == op.position.column {
                // Same-point insertions: earlier (timestamp, author) lands
                // first; the later one is shifted past its length.
                prior.order_key() <= op.order_key()
            } else {
                p.column <= op.position.column
            };
            if shift {
                op.position.column += len;
            }
        }
        OpKind::Delete { length: Some(n) } => {
            if p.line == op.position.line && p.column + n <= op.position.column {
                op.position.column -= n;
            }
        }
        OpKind::Delete { length: None } => {
            if p.line < op.position.line {
                op.position.line -= 1;
            }
        }
        OpKind::Replace { length: Some(n), text } => {
            if p.line == op.position.line && p.column + n <= op.position.column {
                let new_len = text.chars().count() as u32;
                op.position.column = op.position.column + new_len - n;
            }
        }
        OpKind::Replace { length: None, .. } => {
            // Whole-document replace intersects everything; detect() never
            // clears an operation past one.
        }
        OpKind::Format { .. } => {
            // No positional effect.
        }
    }
}

/// Clamp an operation into the current document bounds.
///
/// Used when a conflict winner is materialized after the content it was
/// aimed at has shifted. Returns `None` when nothing remains to do (the
/// targeted content is gone entirely).
pub fn clamp_operation(op: &Operation, doc: &DocumentStore) -> Option<Operation> {
    let mut clamped = op.clone();
    if clamped.kind.is_document_replace() {
        clamped.position = Position::new(0, 0);
        return Some(clamped);
    }

    let last_line = doc.line_count().saturating_sub(1) as u32;
    clamped.position.line = clamped.position.line.min(last_line);
    let line_len = doc.line_len(clamped.position.line).unwrap_or(0);
    clamped.position.column = clamped.position.column.min(line_len);
    let available = line_len - clamped.position.column;

    match &mut clamped.kind {
        OpKind::Insert { .. } => Some(clamped),
        OpKind::Delete { length: Some(n) } => {
            *n = (*n).min(available);
            if *n == 0 {
                None
            } else {
                Some(clamped)
            }
        }
        OpKind::Delete { length: None } => Some(clamped),
        OpKind::Replace { length: Some(n), text } => {
            *n = (*n).min(available);
            if *n == 0 {
                // The replaced range is gone; keep the content as an insert.
                let text = std::mem::take(text);
                clamped.kind = OpKind::Insert { text };
                Some(clamped)
            } else {
                Some(clamped)
            }
        }
        OpKind::Replace { length: None, .. } => unreachable!("handled above"),
        OpKind::Format { length, .. } => {
            *length = (*length).min(available);
            if *length == 0 {
                None
            } else {
                Some(clamped)
            }
        }
    }
}

/// Candidate merged content the `Suggestions` policy proposes: the held
/// operation's affected line (or whole document) as it would read if the
/// held operation won.
pub fn suggest_merge(doc: &DocumentStore, held: &Operation) -> Option<String> {
    let clamped = clamp_operation(held, doc)?;
    let mut preview = doc.clone();
    preview.apply(&clamped).ok()?;
    if clamped.kind.is_document_replace() {
        Some(preview.content())
    } else {
        preview.line(clamped.position.line).map(String::from)
    }
}

// ───────────────────────────────────────────────────────────────────
// Conflict records
// ───────────────────────────────────────────────────────────────────

/// Conflict lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Ignored,
}

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionStrategy {
    /// The held operation won and was materialized.
    Accept,
    /// The held operation's content was discarded.
    Reject,
    /// Both sides kept (or caller-supplied merged content applied).
    Merge,
    /// Explicitly settled by a participant.
    Manual,
}

/// Terminal record attached to a resolved conflict. Immutable once set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    pub resolved_by: Uuid,
    pub final_content: String,
    pub timestamp_ms: u64,
}

impl ConflictResolution {
    pub fn new(strategy: ResolutionStrategy, resolved_by: Uuid, final_content: String) -> Self {
        Self {
            strategy,
            resolved_by,
            final_content,
            timestamp_ms: now_millis(),
        }
    }
}

/// A detected collision between concurrent operations.
///
/// Holds the submitted operation until resolution — an operation is either
/// applied or held here, never silently discarded.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub id: Uuid,
    /// The held operation plus every intersecting applied operation.
    pub operation_ids: Vec<Uuid>,
    /// Authors of the colliding operations.
    pub participant_ids: Vec<Uuid>,
    /// True character overlap (false = proximity-window hit only).
    pub spatial_overlap: bool,
    pub status: ConflictStatus,
    pub resolution: Option<ConflictResolution>,
    /// Candidate merge under the `Suggestions` policy.
    pub suggestion: Option<String>,
    /// The submitted operation awaiting resolution.
    pub held: Operation,
    /// The intersecting, already-applied operations.
    pub applied: Vec<Operation>,
    created_at: Instant,
}

impl Conflict {
    pub fn new(held: Operation, candidate: ConflictCandidate) -> Self {
        let mut operation_ids = vec![held.id];
        operation_ids.extend(candidate.intersecting.iter().map(|o| o.id));

        let mut participant_ids = vec![held.author_id];
        for o in &candidate.intersecting {
            if !participant_ids.contains(&o.author_id) {
                participant_ids.push(o.author_id);
            }
        }

        Self {
            id: Uuid::new_v4(),
            operation_ids,
            participant_ids,
            spatial_overlap: candidate.spatial_overlap,
            status: ConflictStatus::Pending,
            resolution: None,
            suggestion: None,
            held,
            applied: candidate.intersecting,
            created_at: Instant::now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::Pending
    }

    /// Whether a pending conflict has outlived the staleness window.
    pub fn is_stale(&self, window: Duration) -> bool {
        self.is_pending() && self.created_at.elapsed() >= window
    }

    /// Transition to `Resolved`. Returns false if already terminal —
    /// resolution happens exactly once.
    pub fn mark_resolved(&mut self, resolution: ConflictResolution) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = ConflictStatus::Resolved;
        self.resolution = Some(resolution);
        true
    }

    /// Transition to `Ignored` (explicit no-op decision). Terminal.
    pub fn mark_ignored(&mut self) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = ConflictStatus::Ignored;
        true
    }

    /// Whether the held operation beats every applied rival under the
    /// `(timestamp, author_id)` precedence rule.
    pub fn held_wins(&self) -> bool {
        let held_key = self.held.order_key();
        self.applied.iter().all(|o| held_key > o.order_key())
    }

    /// Authors on the losing side of an auto resolution.
    pub fn losers(&self, winner: Uuid) -> Vec<Uuid> {
        self.participant_ids
            .iter()
            .copied()
            .filter(|id| *id != winner)
            .collect()
    }
}

// ===================================================================
// Tests
// ===================================================================
