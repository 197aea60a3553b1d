//! External collaborator seams: membership checks and activity auditing.
//!
//! The engine owns no membership data and no audit storage — both are
//! injected as trait objects. Membership is consulted as a boolean
//! capability check on join and submit; activity events are
//! fire-and-forget and never on the error path.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::conflict::ResolutionStrategy;

// ───────────────────────────────────────────────────────────────────
// Membership
// ───────────────────────────────────────────────────────────────────

/// Workspace role of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Viewer,
    Editor,
    Admin,
    Owner,
}

impl Role {
    /// Whether this role may submit content mutations.
    pub fn can_edit(&self) -> bool {
        matches!(self, Role::Editor | Role::Admin | Role::Owner)
    }
}

/// Membership record for one (workspace, user) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub role: Role,
}

/// Workspace/membership lookup, owned by an external service.
pub trait MembershipService: Send + Sync {
    /// Membership of `user_id` in `workspace_id`, or `None` if not an
    /// active member.
    fn member(&self, workspace_id: Uuid, user_id: Uuid) -> Option<Membership>;
}

/// In-memory membership table for tests and single-process embedding.
#[derive(Default)]
pub struct StaticMembership {
    members: Mutex<HashMap<(Uuid, Uuid), Membership>>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, workspace_id: Uuid, user_id: Uuid, role: Role) {
        self.members
            .lock()
            .expect("membership table poisoned")
            .insert((workspace_id, user_id), Membership { role });
    }

    pub fn revoke(&self, workspace_id: Uuid, user_id: Uuid) {
        self.members
            .lock()
            .expect("membership table poisoned")
            .remove(&(workspace_id, user_id));
    }
}

impl MembershipService for StaticMembership {
    fn member(&self, workspace_id: Uuid, user_id: Uuid) -> Option<Membership> {
        self.members
            .lock()
            .expect("membership table poisoned")
            .get(&(workspace_id, user_id))
            .copied()
    }
}

// ───────────────────────────────────────────────────────────────────
// Activity / audit
// ───────────────────────────────────────────────────────────────────

/// One audit record emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActivityEvent {
    ParticipantJoined {
        workspace_id: Uuid,
        project_id: Uuid,
        user_id: Uuid,
    },
    ParticipantLeft {
        workspace_id: Uuid,
        project_id: Uuid,
        user_id: Uuid,
    },
    OperationApplied {
        project_id: Uuid,
        operation_id: Uuid,
        author_id: Uuid,
        revision: u64,
    },
    ConflictResolved {
        project_id: Uuid,
        conflict_id: Uuid,
        strategy: ResolutionStrategy,
        losers: Vec<Uuid>,
    },
    VersionCreated {
        project_id: Uuid,
        version_id: Uuid,
        revision: u64,
    },
}

/// Fire-and-forget audit sink. Implementations must not block the
/// submission path; failures are the sink's problem, not the engine's.
pub trait ActivitySink: Send + Sync {
    fn record(&self, event: ActivityEvent);
}

/// Sink that drops everything.
#[derive(Default)]
pub struct NullSink;

impl ActivitySink for NullSink {
    fn record(&self, _event: ActivityEvent) {}
}

/// Sink that buffers events in memory (tests, debugging).
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ActivityEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ActivityEvent> {
        self.events.lock().expect("sink poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ActivitySink for MemorySink {
    fn record(&self, event: ActivityEvent) {
        self.events.lock().expect("sink poisoned").push(event);
    }
}
