//! Document Store — the materialized content of one project.
//!
//! Content is an ordered sequence of lines with character-indexed columns.
//! The store is pure data: it validates and applies *effective* (already
//! rebased) operations and tracks the monotonic revision counter, but owns
//! no concurrency logic. Exclusive mutation rights belong to the Session
//! Coordinator for the owning project.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            DocumentStore                 │
//! │                                         │
//! │  lines: ["fn main() {", "    ...", "}"] │
//! │  revision: 42  (gapless, monotonic)     │
//! │                                         │
//! │  apply(op) → validate → mutate → rev+1  │
//! └─────────────────────────────────────────┘
//! ```

use uuid::Uuid;

use crate::error::EngineError;
use crate::operation::{LogEntry, OpKind, Operation};

/// A line/column coordinate in document content.
///
/// Columns are character indices (not bytes), so multi-byte UTF-8 content
/// addresses the same way on every client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// FNV-1a checksum over content bytes.
///
/// Used for version integrity and log-entry verification.
pub fn content_checksum(content: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5; // FNV offset basis
    for byte in content.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193); // FNV prime
    }
    hash
}

/// Split raw text into document lines. Empty text is a single empty line —
/// a document always has at least one addressable line.
pub fn split_lines(text: &str) -> Vec<String> {
    text.split('\n').map(String::from).collect()
}

/// The materialized content of a single project document.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    project_id: Uuid,
    lines: Vec<String>,
    revision: u64,
}

impl DocumentStore {
    /// Create a store at revision 0 with the given initial content.
    pub fn new(project_id: Uuid, initial_content: &str) -> Self {
        Self {
            project_id,
            lines: split_lines(initial_content),
            revision: 0,
        }
    }

    /// Create a store at an explicit revision (resync / partial replay).
    pub fn at_revision(project_id: Uuid, content: &str, revision: u64) -> Self {
        Self {
            project_id,
            lines: split_lines(content),
            revision,
        }
    }

    pub fn project_id(&self) -> Uuid {
        self.project_id
    }

    /// Current document revision. Strictly increasing, gapless across
    /// applied operations, never reused.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn line(&self, index: u32) -> Option<&str> {
        self.lines.get(index as usize).map(String::as_str)
    }

    /// Full content, lines joined with `\n`.
    pub fn content(&self) -> String {
        self.lines.join("\n")
    }

    /// FNV-1a checksum of the current content.
    pub fn checksum(&self) -> u32 {
        content_checksum(&self.content())
    }

    /// Character length of a line (columns are character indices).
    pub fn line_len(&self, index: u32) -> Option<u32> {
        self.lines
            .get(index as usize)
            .map(|l| l.chars().count() as u32)
    }

    /// Validate an operation against current content bounds without
    /// mutating. Structural failures here never enter the log.
    pub fn validate(&self, op: &Operation) -> Result<(), EngineError> {
        let pos = op.position;
        let out_of_bounds = EngineError::InvalidPosition {
            line: pos.line,
            column: pos.column,
        };

        if let OpKind::Replace { length: None, .. } = &op.kind {
            // Whole-document replace anchors at the origin.
            if pos.line != 0 || pos.column != 0 {
                return Err(out_of_bounds);
            }
            return Ok(());
        }

        let line_len = self.line_len(pos.line).ok_or(out_of_bounds.clone())?;

        match &op.kind {
            OpKind::Insert { text } => {
                if text.is_empty() {
                    return Err(EngineError::InvalidContent {
                        reason: "empty insertion".into(),
                    });
                }
                if text.contains('\n') {
                    return Err(EngineError::InvalidContent {
                        reason: "in-line insertion may not contain a newline".into(),
                    });
                }
                if pos.column > line_len {
                    return Err(out_of_bounds);
                }
            }
            OpKind::Delete { length: Some(n) } => {
                if *n == 0 {
                    return Err(EngineError::InvalidContent {
                        reason: "zero-length delete".into(),
                    });
                }
                // Widen before adding: client-supplied lengths must not
                // wrap the bounds check.
                if pos.column as u64 + *n as u64 > line_len as u64 {
                    return Err(out_of_bounds);
                }
            }
            OpKind::Delete { length: None } => {
                // Whole-line delete: the line index check above suffices.
            }
            OpKind::Replace { length: Some(n), text } => {
                if *n == 0 {
                    return Err(EngineError::InvalidContent {
                        reason: "zero-length replace".into(),
                    });
                }
                if text.contains('\n') {
                    return Err(EngineError::InvalidContent {
                        reason: "in-line replace may not contain a newline".into(),
                    });
                }
                if pos.column as u64 + *n as u64 > line_len as u64 {
                    return Err(out_of_bounds);
                }
            }
            OpKind::Replace { length: None, .. } => unreachable!("handled above"),
            OpKind::Format { length, .. } => {
                if *length == 0 {
                    return Err(EngineError::InvalidContent {
                        reason: "zero-length format range".into(),
                    });
                }
                if pos.column as u64 + *length as u64 > line_len as u64 {
                    return Err(out_of_bounds);
                }
            }
        }
        Ok(())
    }

    /// Apply an effective operation, assigning the next revision.
    ///
    /// Returns the revision the operation was materialized at.
    pub fn apply(&mut self, op: &Operation) -> Result<u64, EngineError> {
        self.validate(op)?;

        let line_idx = op.position.line as usize;
        let col = op.position.column;

        match &op.kind {
            OpKind::Insert { text } => {
                let line = &mut self.lines[line_idx];
                let at = char_to_byte(line, col);
                line.insert_str(at, text);
            }
            OpKind::Delete { length: Some(n) } => {
                let line = &mut self.lines[line_idx];
                let start = char_to_byte(line, col);
                let end = char_to_byte(line, col + n);
                line.replace_range(start..end, "");
            }
            OpKind::Delete { length: None } => {
                self.lines.remove(line_idx);
                if self.lines.is_empty() {
                    self.lines.push(String::new());
                }
            }
            OpKind::Replace { length: Some(n), text } => {
                let line = &mut self.lines[line_idx];
                let start = char_to_byte(line, col);
                let end = char_to_byte(line, col + n);
                line.replace_range(start..end, text);
            }
            OpKind::Replace { length: None, text } => {
                self.lines = split_lines(text);
            }
            OpKind::Format { .. } => {
                // Content-neutral annotation: logged and broadcast, but the
                // line text is unchanged.
            }
        }

        self.revision += 1;
        Ok(self.revision)
    }

    /// Rebuild a document by replaying effective log entries on top of
    /// initial content. Entry revisions must be contiguous with the
    /// starting revision (0 for a full replay).
    pub fn replay(
        project_id: Uuid,
        initial_content: &str,
        start_revision: u64,
        entries: &[LogEntry],
    ) -> Result<Self, EngineError> {
        let mut doc = Self::at_revision(project_id, initial_content, start_revision);
        for entry in entries {
            let rev = doc.apply(&entry.operation)?;
            if rev != entry.revision {
                return Err(EngineError::EncodingError(format!(
                    "replay revision mismatch: applied {rev}, entry says {}",
                    entry.revision
                )));
            }
        }
        Ok(doc)
    }
}

/// Convert a character column to a byte offset within a line.
///
/// Callers must have validated `col <= char length`.
fn char_to_byte(line: &str, col: u32) -> usize {
    if col == 0 {
        return 0;
    }
    line.char_indices()
        .nth(col as usize)
        .map(|(i, _)| i)
        .unwrap_or(line.len())
}
