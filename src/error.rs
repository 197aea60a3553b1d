//! Unified error taxonomy for the collaborative editing engine.
//!
//! Structural errors are returned synchronously to the submitting
//! participant and never broadcast. Conflicts are *not* errors — they are
//! first-class outcomes; only a query against a still-pending manual
//! conflict surfaces as [`EngineError::ConflictUnresolved`].

use uuid::Uuid;

/// Engine-wide error type.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Operation submitted against a torn-down or unknown session.
    /// The client must rejoin.
    SessionNotFound,
    /// The operation's base revision is older than the operation log's
    /// pruning horizon. The client must resync from the latest version
    /// and replay.
    StaleBaseRevision { base: u64, horizon: u64 },
    /// The operation's base revision is newer than the document head —
    /// a client sync bug, not a spatial error.
    RevisionAhead { base: u64, head: u64 },
    /// An operation outcome was queried while the conflict is still
    /// pending under the manual policy. A valid transient state.
    ConflictUnresolved { conflict_id: Uuid },
    /// Operation addresses a line/column outside current content bounds.
    /// Rejected immediately; never enters the log.
    InvalidPosition { line: u32, column: u32 },
    /// Operation payload is malformed (embedded newline in an in-line
    /// edit, zero-length delete, and similar).
    InvalidContent { reason: String },
    /// Diff/rollback against a pruned or nonexistent version.
    VersionNotFound { version_id: Uuid },
    /// Outcome query for an operation that was never submitted here.
    OperationNotFound { operation_id: Uuid },
    /// The referenced conflict does not exist (or belongs to another
    /// project).
    ConflictNotFound { conflict_id: Uuid },
    /// No materialized state exists for the referenced project.
    ProjectNotFound { project_id: Uuid },
    /// The user is not an active member, or lacks edit rights, in the
    /// session's workspace.
    PermissionDenied { user_id: Uuid },
    /// Serialization / deserialization failure (events, log entries,
    /// compressed snapshots).
    EncodingError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SessionNotFound => write!(f, "Session not found"),
            EngineError::StaleBaseRevision { base, horizon } => {
                write!(f, "Base revision {base} is older than log horizon {horizon}")
            }
            EngineError::RevisionAhead { base, head } => {
                write!(f, "Base revision {base} is ahead of document head {head}")
            }
            EngineError::ConflictUnresolved { conflict_id } => {
                write!(f, "Conflict {conflict_id} is still pending")
            }
            EngineError::InvalidPosition { line, column } => {
                write!(f, "Position {line}:{column} is out of bounds")
            }
            EngineError::InvalidContent { reason } => {
                write!(f, "Invalid operation content: {reason}")
            }
            EngineError::VersionNotFound { version_id } => {
                write!(f, "Version {version_id} not found")
            }
            EngineError::OperationNotFound { operation_id } => {
                write!(f, "Operation {operation_id} not found")
            }
            EngineError::ConflictNotFound { conflict_id } => {
                write!(f, "Conflict {conflict_id} not found")
            }
            EngineError::ProjectNotFound { project_id } => {
                write!(f, "Project {project_id} not found")
            }
            EngineError::PermissionDenied { user_id } => {
                write!(f, "User {user_id} is not permitted to perform this action")
            }
            EngineError::EncodingError(e) => write!(f, "Encoding error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
