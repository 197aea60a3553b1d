//! Outcome events broadcast to session participants.
//!
//! Every accepted submission, conflict transition, presence change, and
//! version creation is fanned out as a [`SessionEvent`] — the author
//! included, for confirmation. Events encode with bincode so an outer
//! transport layer can put them on the wire unchanged.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conflict::ResolutionStrategy;
use crate::document::Position;
use crate::error::EngineError;
use crate::operation::Operation;
use crate::presence::Selection;

/// A broadcastable session outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// A participant joined the session.
    ParticipantJoined { session_id: Uuid, user_id: Uuid },

    /// A participant left (or was evicted as idle).
    ParticipantLeft { session_id: Uuid, user_id: Uuid },

    /// An operation was materialized at `revision`.
    OperationApplied {
        project_id: Uuid,
        revision: u64,
        operation: Operation,
    },

    /// A submission collided with concurrent edits; a Conflict record
    /// now references all involved operations.
    OperationConflicted {
        project_id: Uuid,
        conflict_id: Uuid,
        operation_ids: Vec<Uuid>,
        participant_ids: Vec<Uuid>,
    },

    /// A conflict reached its terminal resolution. `losers` names the
    /// authors whose content was discarded — discard is never silent.
    ConflictResolved {
        project_id: Uuid,
        conflict_id: Uuid,
        strategy: ResolutionStrategy,
        resolved_by: Uuid,
        losers: Vec<Uuid>,
        final_revision: Option<u64>,
    },

    /// A conflict was explicitly closed as a no-op.
    ConflictIgnored { project_id: Uuid, conflict_id: Uuid },

    /// Cursor/selection/typing change for one participant.
    PresenceUpdated {
        session_id: Uuid,
        user_id: Uuid,
        cursor: Option<Position>,
        selection: Option<Selection>,
        is_typing: bool,
    },

    /// A version snapshot was recorded.
    VersionCreated {
        project_id: Uuid,
        version_id: Uuid,
        revision: u64,
    },

    /// The session was torn down (last participant left).
    SessionClosed { session_id: Uuid },
}

impl SessionEvent {
    /// Short tag for logging.
    pub fn tag(&self) -> &'static str {
        match self {
            SessionEvent::ParticipantJoined { .. } => "participant_joined",
            SessionEvent::ParticipantLeft { .. } => "participant_left",
            SessionEvent::OperationApplied { .. } => "operation_applied",
            SessionEvent::OperationConflicted { .. } => "operation_conflicted",
            SessionEvent::ConflictResolved { .. } => "conflict_resolved",
            SessionEvent::ConflictIgnored { .. } => "conflict_ignored",
            SessionEvent::PresenceUpdated { .. } => "presence_updated",
            SessionEvent::VersionCreated { .. } => "version_created",
            SessionEvent::SessionClosed { .. } => "session_closed",
        }
    }

    /// Encode to binary for an outer transport.
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| EngineError::EncodingError(e.to_string()))
    }

    /// Decode from binary.
    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| EngineError::EncodingError(e.to_string()))?;
        Ok(event)
    }
}
