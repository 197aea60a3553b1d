//! Session Coordinator — the serialization point for collaborative edits.
//!
//! One session per (workspace, project) pair. Every mutation of a project
//! flows through that project's async mutex, so revision assignment,
//! conflict detection, version triggers, and event fan-out all happen
//! inside one serialized unit of work:
//!
//! ```text
//!                  ┌──────────────────────────────┐
//! submit(op) ────► │  project mutex (serialized)  │
//!                  │                              │
//!                  │  sweep stale conflicts       │
//!                  │  validate → detect           │
//!                  │   ├─ clear: rebase + apply   │
//!                  │   └─ collision: Conflict     │
//!                  │  version triggers            │
//!                  └──────────┬───────────────────┘
//!                             ▼
//!                  broadcast to all participants
//! ```
//!
//! Session teardown clears presence only. Document, log, and version
//! state belong to the project and survive until the process ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::SessionBroadcast;
use crate::conflict::{
    clamp_operation, detect, rebase, suggest_merge, Conflict, ConflictCandidate, ConflictConfig,
    ConflictPolicy, ConflictResolution, ResolutionStrategy,
};
use crate::document::{DocumentStore, Position};
use crate::error::EngineError;
use crate::events::SessionEvent;
use crate::operation::{LogConfig, LogEntry, OpKind, Operation, OperationLog};
use crate::presence::{PresenceRoster, Selection};
use crate::services::{ActivityEvent, ActivitySink, MembershipService};
use crate::version::{diff, Version, VersionChange, VersionPolicy, VersionStore};

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

/// Engine-wide configuration bundle.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Broadcast buffer per subscriber.
    pub broadcast_capacity: usize,
    pub conflict: ConflictConfig,
    pub log: LogConfig,
    pub versions: VersionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            conflict: ConflictConfig::default(),
            log: LogConfig::default(),
            versions: VersionPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Config for testing (manual conflicts, tiny windows and buffers).
    pub fn for_testing() -> Self {
        Self {
            broadcast_capacity: 32,
            conflict: ConflictConfig::for_testing(),
            log: LogConfig::for_testing(),
            versions: VersionPolicy::for_testing(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Sessions and project state
// ───────────────────────────────────────────────────────────────────

/// Synchronous answer to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Materialized at `revision` (possibly after rebasing).
    Applied { revision: u64 },
    /// Held in a conflict record; resolution follows via events.
    Conflicted { conflict_id: Uuid },
}

/// A participant's decision on a pending conflict.
#[derive(Debug, Clone)]
pub struct ResolutionChoice {
    pub strategy: ResolutionStrategy,
    pub resolved_by: Uuid,
    /// Required for `Merge`; ignored otherwise.
    pub merged_content: Option<String>,
}

/// Handle returned to a joining participant.
#[derive(Debug)]
pub struct JoinedSession {
    pub session_id: Uuid,
    pub project_id: Uuid,
    /// Receives every event published after the join.
    pub events: broadcast::Receiver<Arc<SessionEvent>>,
}

/// A live editing session for one (workspace, project) pair.
pub struct Session {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub project_id: Uuid,
    roster: Mutex<PresenceRoster>,
    broadcast: SessionBroadcast,
}

impl Session {
    fn new(workspace_id: Uuid, project_id: Uuid, broadcast_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            project_id,
            roster: Mutex::new(PresenceRoster::new()),
            broadcast: SessionBroadcast::new(broadcast_capacity),
        }
    }
}

/// Everything the engine owns for one project. Guarded by a single async
/// mutex — the per-project serialization point.
struct ProjectState {
    document: DocumentStore,
    log: OperationLog,
    versions: VersionStore,
    conflicts: HashMap<Uuid, Conflict>,
}

impl ProjectState {
    fn new(project_id: Uuid, initial_content: &str, config: &EngineConfig) -> Self {
        Self {
            document: DocumentStore::new(project_id, initial_content),
            log: OperationLog::new(config.log.clone()),
            versions: VersionStore::new(project_id, config.versions.clone()),
            conflicts: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct EngineCounters {
    operations_applied: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_resolved: AtomicU64,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub sessions: usize,
    pub projects: usize,
    pub operations_applied: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
}

// ───────────────────────────────────────────────────────────────────
// Coordinator
// ───────────────────────────────────────────────────────────────────

/// Owns all sessions and project state; routes every operation through
/// the owning project's serialized unit of work.
pub struct SessionCoordinator {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    /// (workspace, project) → session id. Locked before `sessions`.
    by_project: RwLock<HashMap<(Uuid, Uuid), Uuid>>,
    projects: RwLock<HashMap<Uuid, Arc<Mutex<ProjectState>>>>,
    membership: Arc<dyn MembershipService>,
    activity: Arc<dyn ActivitySink>,
    config: EngineConfig,
    counters: EngineCounters,
}

impl SessionCoordinator {
    pub fn new(
        membership: Arc<dyn MembershipService>,
        activity: Arc<dyn ActivitySink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            by_project: RwLock::new(HashMap::new()),
            projects: RwLock::new(HashMap::new()),
            membership,
            activity,
            config,
            counters: EngineCounters::default(),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Materialize a project with seed content. Idempotent: an already
    /// open project keeps its state. Returns whether it was created.
    pub async fn open_project(&self, project_id: Uuid, initial_content: &str) -> bool {
        let mut projects = self.projects.write().await;
        if projects.contains_key(&project_id) {
            log::debug!("Project {project_id} already open");
            return false;
        }
        projects.insert(
            project_id,
            Arc::new(Mutex::new(ProjectState::new(project_id, initial_content, &self.config))),
        );
        log::info!("Project {project_id} opened");
        true
    }

    /// Join the editing session for a project, creating both the project
    /// state (empty) and the session if needed.
    pub async fn join(
        &self,
        workspace_id: Uuid,
        project_id: Uuid,
        user_id: Uuid,
    ) -> Result<JoinedSession, EngineError> {
        if self.membership.member(workspace_id, user_id).is_none() {
            return Err(EngineError::PermissionDenied { user_id });
        }

        self.ensure_project(project_id).await;
        let session = self.get_or_create_session(workspace_id, project_id).await;

        // Subscribe before publishing so the joiner observes their own
        // join confirmation.
        let events = session.broadcast.subscribe();
        let newly_joined = { session.roster.lock().await.join(user_id) };
        if newly_joined {
            log::info!("Participant {user_id} joined session {}", session.id);
            session.broadcast.publish(SessionEvent::ParticipantJoined {
                session_id: session.id,
                user_id,
            });
            self.activity.record(ActivityEvent::ParticipantJoined {
                workspace_id,
                project_id,
                user_id,
            });
        }

        Ok(JoinedSession { session_id: session.id, project_id, events })
    }

    /// Join an existing session by id. Unlike [`join`](Self::join) this
    /// never creates anything: a torn-down session is `SessionNotFound`
    /// and the caller must rejoin through the project.
    pub async fn join_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Result<JoinedSession, EngineError> {
        let session = self.session(session_id).await?;
        if self.membership.member(session.workspace_id, user_id).is_none() {
            return Err(EngineError::PermissionDenied { user_id });
        }

        let events = session.broadcast.subscribe();
        let newly_joined = { session.roster.lock().await.join(user_id) };
        if newly_joined {
            log::info!("Participant {user_id} joined session {session_id}");
            session.broadcast.publish(SessionEvent::ParticipantJoined { session_id, user_id });
            self.activity.record(ActivityEvent::ParticipantJoined {
                workspace_id: session.workspace_id,
                project_id: session.project_id,
                user_id,
            });
        }
        Ok(JoinedSession { session_id, project_id: session.project_id, events })
    }

    /// Leave a session. Tears the session down when the last participant
    /// departs; project state survives.
    pub async fn leave(&self, session_id: Uuid, user_id: Uuid) -> Result<(), EngineError> {
        let session = self.session(session_id).await?;
        let (left, now_empty) = {
            let mut roster = session.roster.lock().await;
            let left = roster.leave(user_id);
            (left, roster.is_empty())
        };
        if !left {
            return Ok(());
        }

        session.broadcast.publish(SessionEvent::ParticipantLeft { session_id, user_id });
        self.activity.record(ActivityEvent::ParticipantLeft {
            workspace_id: session.workspace_id,
            project_id: session.project_id,
            user_id,
        });

        if now_empty {
            self.close_session(&session).await;
        }
        Ok(())
    }

    /// Connected participants of a session.
    pub async fn participants(&self, session_id: Uuid) -> Result<Vec<Uuid>, EngineError> {
        let session = self.session(session_id).await?;
        let roster = session.roster.lock().await;
        Ok(roster.user_ids())
    }

    // ── Submission ───────────────────────────────────────────────

    /// Submit an operation through the owning project's serialized unit
    /// of work.
    ///
    /// Clear submissions are rebased over the unseen log suffix, applied,
    /// logged, and broadcast. Collisions produce a [`Conflict`] record and
    /// are settled per the configured [`ConflictPolicy`].
    pub async fn submit_operation(
        &self,
        session_id: Uuid,
        op: Operation,
    ) -> Result<OperationOutcome, EngineError> {
        let session = self.session(session_id).await?;
        self.require_editor(session.workspace_id, op.author_id)?;

        let project = self.project(session.project_id).await?;
        let mut guard = project.lock().await;
        let state = &mut *guard;

        self.sweep_stale(state, Some(&session));

        enum Checked {
            Clear(Operation),
            Collides(ConflictCandidate),
        }
        let window = self.config.conflict.proximity_window;
        let checked = {
            // Causality before bounds: a stale client needs the resync
            // signal, not a spatial error against content it never saw.
            let unseen = state.log.unseen_since(op.base_revision)?;
            state.document.validate(&op)?;
            match detect(&op, &unseen, window) {
                Some(candidate) => Checked::Collides(candidate),
                None => Checked::Clear(rebase(&op, &unseen)),
            }
        };

        match checked {
            Checked::Clear(effective) => {
                let revision = state.document.apply(&effective)?;
                self.finish_apply(state, Some(&session), effective, revision);
                Ok(OperationOutcome::Applied { revision })
            }
            Checked::Collides(candidate) => {
                self.counters.conflicts_detected.fetch_add(1, Ordering::Relaxed);
                let mut conflict = Conflict::new(op, candidate);
                let conflict_id = conflict.id;
                log::info!(
                    "Conflict {} on project {} involving {} operations",
                    conflict_id,
                    session.project_id,
                    conflict.operation_ids.len()
                );

                session.broadcast.publish(SessionEvent::OperationConflicted {
                    project_id: session.project_id,
                    conflict_id,
                    operation_ids: conflict.operation_ids.clone(),
                    participant_ids: conflict.participant_ids.clone(),
                });

                match self.config.conflict.policy {
                    ConflictPolicy::Auto => {
                        self.auto_resolve(state, Some(&session), &mut conflict);
                    }
                    ConflictPolicy::Suggestions => {
                        conflict.suggestion = suggest_merge(&state.document, &conflict.held);
                    }
                    ConflictPolicy::Manual => {}
                }

                state.conflicts.insert(conflict_id, conflict);
                Ok(OperationOutcome::Conflicted { conflict_id })
            }
        }
    }

    /// Final status of a submitted operation.
    ///
    /// Pending manual conflicts surface as [`EngineError::ConflictUnresolved`]
    /// so callers can distinguish "not yet settled" from "settled".
    pub async fn operation_outcome(
        &self,
        project_id: Uuid,
        operation_id: Uuid,
    ) -> Result<OperationOutcome, EngineError> {
        let project = self.project(project_id).await?;
        let state = project.lock().await;

        if let Some(entry) = state.log.find_operation(operation_id) {
            return Ok(OperationOutcome::Applied { revision: entry.revision });
        }
        for conflict in state.conflicts.values() {
            if conflict.operation_ids.contains(&operation_id) {
                if conflict.is_pending() {
                    return Err(EngineError::ConflictUnresolved { conflict_id: conflict.id });
                }
                return Ok(OperationOutcome::Conflicted { conflict_id: conflict.id });
            }
        }
        Err(EngineError::OperationNotFound { operation_id })
    }

    // ── Conflict resolution ──────────────────────────────────────

    /// Settle a pending conflict with an explicit decision. Terminal
    /// conflicts are left untouched — resolution happens exactly once.
    pub async fn resolve_conflict(
        &self,
        session_id: Uuid,
        conflict_id: Uuid,
        choice: ResolutionChoice,
    ) -> Result<(), EngineError> {
        let session = self.session(session_id).await?;
        self.require_editor(session.workspace_id, choice.resolved_by)?;

        let project = self.project(session.project_id).await?;
        let mut guard = project.lock().await;
        let state = &mut *guard;

        {
            let conflict = state
                .conflicts
                .get(&conflict_id)
                .ok_or(EngineError::ConflictNotFound { conflict_id })?;
            if !conflict.is_pending() {
                log::debug!("Conflict {conflict_id} already settled; resolution ignored");
                return Ok(());
            }
        }

        let merged = match choice.strategy {
            ResolutionStrategy::Merge => match &choice.merged_content {
                Some(text) if !text.contains('\n') => Some(text.clone()),
                Some(_) => {
                    return Err(EngineError::InvalidContent {
                        reason: "merged content may not contain a newline".into(),
                    })
                }
                None => {
                    return Err(EngineError::InvalidContent {
                        reason: "merge resolution requires merged content".into(),
                    })
                }
            },
            ResolutionStrategy::Manual => {
                return Err(EngineError::InvalidContent {
                    reason: "resolution strategy must be accept, reject, or merge".into(),
                })
            }
            _ => None,
        };

        let Some(mut conflict) = state.conflicts.remove(&conflict_id) else {
            return Err(EngineError::ConflictNotFound { conflict_id });
        };
        let held = conflict.held.clone();

        let final_revision = match choice.strategy {
            ResolutionStrategy::Accept => self.materialize_held(state, Some(&session), &held),
            ResolutionStrategy::Merge => merged.as_deref().and_then(|text| {
                self.materialize_merge(
                    state,
                    Some(&session),
                    held.position.line,
                    text,
                    choice.resolved_by,
                )
            }),
            _ => None,
        };

        let losers = match choice.strategy {
            ResolutionStrategy::Accept => conflict.losers(held.author_id),
            ResolutionStrategy::Reject => {
                let winner = conflict
                    .applied
                    .iter()
                    .max_by_key(|o| o.order_key())
                    .map(|o| o.author_id)
                    .unwrap_or(held.author_id);
                conflict.losers(winner)
            }
            // Merge keeps both sides: nobody's content was discarded.
            _ => Vec::new(),
        };

        let final_content = Self::content_after(state, &held);
        let resolution =
            ConflictResolution::new(choice.strategy, choice.resolved_by, final_content);
        if conflict.mark_resolved(resolution) {
            self.counters.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
            session.broadcast.publish(SessionEvent::ConflictResolved {
                project_id: session.project_id,
                conflict_id,
                strategy: choice.strategy,
                resolved_by: choice.resolved_by,
                losers: losers.clone(),
                final_revision,
            });
            self.activity.record(ActivityEvent::ConflictResolved {
                project_id: session.project_id,
                conflict_id,
                strategy: choice.strategy,
                losers,
            });
        }
        state.conflicts.insert(conflict_id, conflict);
        Ok(())
    }

    /// Close a pending conflict as an explicit no-op: the held operation
    /// is dropped and the document is left as-is.
    pub async fn ignore_conflict(
        &self,
        session_id: Uuid,
        conflict_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), EngineError> {
        let session = self.session(session_id).await?;
        self.require_editor(session.workspace_id, user_id)?;

        let project = self.project(session.project_id).await?;
        let mut state = project.lock().await;
        let conflict = state
            .conflicts
            .get_mut(&conflict_id)
            .ok_or(EngineError::ConflictNotFound { conflict_id })?;

        if conflict.mark_ignored() {
            log::info!("Conflict {conflict_id} ignored by {user_id}");
            session.broadcast.publish(SessionEvent::ConflictIgnored {
                project_id: session.project_id,
                conflict_id,
            });
        }
        Ok(())
    }

    /// A conflict record, by id.
    pub async fn conflict(
        &self,
        project_id: Uuid,
        conflict_id: Uuid,
    ) -> Result<Conflict, EngineError> {
        let project = self.project(project_id).await?;
        let state = project.lock().await;
        state
            .conflicts
            .get(&conflict_id)
            .cloned()
            .ok_or(EngineError::ConflictNotFound { conflict_id })
    }

    /// Ids of conflicts still awaiting resolution.
    pub async fn pending_conflicts(&self, project_id: Uuid) -> Result<Vec<Uuid>, EngineError> {
        let project = self.project(project_id).await?;
        let state = project.lock().await;
        Ok(state
            .conflicts
            .values()
            .filter(|c| c.is_pending())
            .map(|c| c.id)
            .collect())
    }

    /// Degrade pending conflicts past the staleness window to automatic
    /// resolution. Also runs lazily on every submission; this entry point
    /// exists for quiet projects, including ones whose session was torn
    /// down while a conflict was still pending (no broadcasts then, but
    /// the audit trail still records the settlement).
    pub async fn expire_stale_conflicts(&self, project_id: Uuid) -> Result<usize, EngineError> {
        let session = self.session_for_project(project_id).await;
        let project = self.project(project_id).await?;
        let mut guard = project.lock().await;
        Ok(self.sweep_stale(&mut guard, session.as_deref()))
    }

    // ── Versions ─────────────────────────────────────────────────

    /// Take an explicit snapshot of the session's project.
    pub async fn snapshot(
        &self,
        session_id: Uuid,
        author: Uuid,
        tags: Vec<String>,
    ) -> Result<Version, EngineError> {
        let session = self.session(session_id).await?;
        self.require_editor(session.workspace_id, author)?;

        let project = self.project(session.project_id).await?;
        let mut guard = project.lock().await;
        let state = &mut *guard;
        let version = state.versions.snapshot(&state.document, author, tags);

        session.broadcast.publish(SessionEvent::VersionCreated {
            project_id: version.project_id,
            version_id: version.id,
            revision: version.revision,
        });
        self.activity.record(ActivityEvent::VersionCreated {
            project_id: version.project_id,
            version_id: version.id,
            revision: version.revision,
        });
        Ok(version)
    }

    /// Retained versions, oldest first.
    pub async fn versions(&self, project_id: Uuid) -> Result<Vec<Version>, EngineError> {
        let project = self.project(project_id).await?;
        let state = project.lock().await;
        Ok(state.versions.list().to_vec())
    }

    /// Line-level diff between two retained versions.
    pub async fn diff_versions(
        &self,
        project_id: Uuid,
        from: Uuid,
        to: Uuid,
    ) -> Result<Vec<VersionChange>, EngineError> {
        let project = self.project(project_id).await?;
        let state = project.lock().await;
        diff(state.versions.get(from)?, state.versions.get(to)?)
    }

    /// Roll the document back to a retained version.
    ///
    /// Rollback is an ordinary whole-document replace through the normal
    /// submission path — conflict-checkable, logged, and broadcast like
    /// any other operation. Rolling back does not delete history.
    pub async fn rollback(
        &self,
        session_id: Uuid,
        version_id: Uuid,
        author: Uuid,
    ) -> Result<OperationOutcome, EngineError> {
        let session = self.session(session_id).await?;
        let op = {
            let project = self.project(session.project_id).await?;
            let state = project.lock().await;
            state.versions.rollback_operation(version_id, state.log.head(), author)?
        };
        log::info!("Rollback of project {} to version {version_id}", session.project_id);
        self.submit_operation(session_id, op).await
    }

    /// Drop log entries at or below `revision` (typically after a snapshot
    /// makes the prefix reproducible from the version store).
    pub async fn prune_log_through(
        &self,
        project_id: Uuid,
        revision: u64,
    ) -> Result<usize, EngineError> {
        let project = self.project(project_id).await?;
        let mut state = project.lock().await;
        Ok(state.log.prune_through(revision))
    }

    // ── Presence ─────────────────────────────────────────────────

    /// Record a cursor move. Returns whether it was broadcast (cursor
    /// updates are rate-limited per participant).
    pub async fn update_cursor(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        cursor: Position,
    ) -> Result<bool, EngineError> {
        let session = self.session(session_id).await?;
        let snapshot = {
            let mut roster = session.roster.lock().await;
            if roster.update_cursor(user_id, cursor) {
                roster.get(user_id).map(|p| (p.selection, p.is_typing))
            } else {
                None
            }
        };
        if let Some((selection, is_typing)) = snapshot {
            session.broadcast.publish(SessionEvent::PresenceUpdated {
                session_id,
                user_id,
                cursor: Some(cursor),
                selection,
                is_typing,
            });
            return Ok(true);
        }
        Ok(false)
    }

    /// Record a selection change. Always broadcast for known participants.
    pub async fn update_selection(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        selection: Option<Selection>,
    ) -> Result<bool, EngineError> {
        let session = self.session(session_id).await?;
        let snapshot = {
            let mut roster = session.roster.lock().await;
            if roster.update_selection(user_id, selection) {
                roster.get(user_id).map(|p| (p.cursor, p.is_typing))
            } else {
                None
            }
        };
        if let Some((cursor, is_typing)) = snapshot {
            session.broadcast.publish(SessionEvent::PresenceUpdated {
                session_id,
                user_id,
                cursor,
                selection,
                is_typing,
            });
            return Ok(true);
        }
        Ok(false)
    }

    /// Raise or clear a typing indicator. Broadcast only on transitions.
    pub async fn set_typing(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        typing: bool,
    ) -> Result<bool, EngineError> {
        let session = self.session(session_id).await?;
        let snapshot = {
            let mut roster = session.roster.lock().await;
            if roster.set_typing(user_id, typing) {
                roster.get(user_id).map(|p| (p.cursor, p.selection))
            } else {
                None
            }
        };
        if let Some((cursor, selection)) = snapshot {
            session.broadcast.publish(SessionEvent::PresenceUpdated {
                session_id,
                user_id,
                cursor,
                selection,
                is_typing: typing,
            });
            return Ok(true);
        }
        Ok(false)
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Current full content of a project.
    pub async fn content(&self, project_id: Uuid) -> Result<String, EngineError> {
        let project = self.project(project_id).await?;
        let state = project.lock().await;
        Ok(state.document.content())
    }

    /// Retained log entries in revision order, for replay or an outer
    /// persistence layer.
    pub async fn log_entries(&self, project_id: Uuid) -> Result<Vec<LogEntry>, EngineError> {
        let project = self.project(project_id).await?;
        let state = project.lock().await;
        Ok(state.log.entries().cloned().collect())
    }

    /// Current document revision of a project.
    pub async fn revision(&self, project_id: Uuid) -> Result<u64, EngineError> {
        let project = self.project(project_id).await?;
        let state = project.lock().await;
        Ok(state.document.revision())
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            sessions: self.sessions.read().await.len(),
            projects: self.projects.read().await.len(),
            operations_applied: self.counters.operations_applied.load(Ordering::Relaxed),
            conflicts_detected: self.counters.conflicts_detected.load(Ordering::Relaxed),
            conflicts_resolved: self.counters.conflicts_resolved.load(Ordering::Relaxed),
        }
    }

    // ── Internals ────────────────────────────────────────────────

    async fn session(&self, session_id: Uuid) -> Result<Arc<Session>, EngineError> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(EngineError::SessionNotFound)
    }

    async fn session_for_project(&self, project_id: Uuid) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.project_id == project_id)
            .cloned()
    }

    async fn project(&self, project_id: Uuid) -> Result<Arc<Mutex<ProjectState>>, EngineError> {
        self.projects
            .read()
            .await
            .get(&project_id)
            .cloned()
            .ok_or(EngineError::ProjectNotFound { project_id })
    }

    fn require_editor(&self, workspace_id: Uuid, user_id: Uuid) -> Result<(), EngineError> {
        match self.membership.member(workspace_id, user_id) {
            Some(member) if member.role.can_edit() => Ok(()),
            _ => Err(EngineError::PermissionDenied { user_id }),
        }
    }

    async fn ensure_project(&self, project_id: Uuid) -> Arc<Mutex<ProjectState>> {
        {
            let projects = self.projects.read().await;
            if let Some(project) = projects.get(&project_id) {
                return project.clone();
            }
        }
        let mut projects = self.projects.write().await;
        projects
            .entry(project_id)
            .or_insert_with(|| {
                log::info!("Project {project_id} opened (empty)");
                Arc::new(Mutex::new(ProjectState::new(project_id, "", &self.config)))
            })
            .clone()
    }

    async fn get_or_create_session(&self, workspace_id: Uuid, project_id: Uuid) -> Arc<Session> {
        let key = (workspace_id, project_id);
        {
            let by_project = self.by_project.read().await;
            if let Some(session_id) = by_project.get(&key) {
                if let Some(session) = self.sessions.read().await.get(session_id) {
                    return session.clone();
                }
            }
        }

        let mut by_project = self.by_project.write().await;
        let mut sessions = self.sessions.write().await;
        // Double-check: another task may have created it while we waited.
        if let Some(session_id) = by_project.get(&key) {
            if let Some(session) = sessions.get(session_id) {
                return session.clone();
            }
        }

        let session =
            Arc::new(Session::new(workspace_id, project_id, self.config.broadcast_capacity));
        by_project.insert(key, session.id);
        sessions.insert(session.id, session.clone());
        log::info!("Session {} created for project {project_id}", session.id);
        session
    }

    async fn close_session(&self, session: &Session) {
        session.broadcast.publish(SessionEvent::SessionClosed { session_id: session.id });
        let mut by_project = self.by_project.write().await;
        let mut sessions = self.sessions.write().await;
        by_project.remove(&(session.workspace_id, session.project_id));
        sessions.remove(&session.id);
        log::info!("Session {} closed (last participant left)", session.id);
    }

    /// Degrade pending conflicts past the staleness window. Runs inside
    /// the project lock on every submission. `session` is `None` when the
    /// project currently has no live session to broadcast through.
    fn sweep_stale(&self, state: &mut ProjectState, session: Option<&Session>) -> usize {
        let window = self.config.conflict.staleness_window;
        let stale: Vec<Uuid> = state
            .conflicts
            .values()
            .filter(|c| c.is_stale(window))
            .map(|c| c.id)
            .collect();
        for conflict_id in &stale {
            if let Some(mut conflict) = state.conflicts.remove(conflict_id) {
                log::info!("Conflict {conflict_id} exceeded staleness window; auto-resolving");
                self.auto_resolve(state, session, &mut conflict);
                state.conflicts.insert(*conflict_id, conflict);
            }
        }
        stale.len()
    }

    /// Settle a conflict deterministically: proximity-only collisions keep
    /// both sides; true overlaps go to the later `(timestamp, author_id)`.
    fn auto_resolve(
        &self,
        state: &mut ProjectState,
        session: Option<&Session>,
        conflict: &mut Conflict,
    ) {
        let held = conflict.held.clone();
        let project_id = state.document.project_id();

        let (strategy, winner) = if !conflict.spatial_overlap {
            (ResolutionStrategy::Merge, held.author_id)
        } else if conflict.held_wins() {
            (ResolutionStrategy::Accept, held.author_id)
        } else {
            let winner = conflict
                .applied
                .iter()
                .max_by_key(|o| o.order_key())
                .map(|o| o.author_id)
                .unwrap_or(held.author_id);
            (ResolutionStrategy::Reject, winner)
        };

        let final_revision = match strategy {
            ResolutionStrategy::Reject => None,
            _ => self.materialize_held(state, session, &held),
        };

        let final_content = Self::content_after(state, &held);
        let resolution = ConflictResolution::new(strategy, winner, final_content);
        if conflict.mark_resolved(resolution) {
            self.counters.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
            let losers = conflict.losers(winner);
            log::info!(
                "Conflict {} auto-resolved: {strategy:?}, winner {winner}",
                conflict.id
            );
            if let Some(session) = session {
                session.broadcast.publish(SessionEvent::ConflictResolved {
                    project_id,
                    conflict_id: conflict.id,
                    strategy,
                    resolved_by: winner,
                    losers: losers.clone(),
                    final_revision,
                });
            }
            self.activity.record(ActivityEvent::ConflictResolved {
                project_id,
                conflict_id: conflict.id,
                strategy,
                losers,
            });
        }
    }

    /// Materialize a winning held operation: rebase over what it missed,
    /// clamp into current bounds, apply. `None` when nothing remains to do.
    fn materialize_held(
        &self,
        state: &mut ProjectState,
        session: Option<&Session>,
        held: &Operation,
    ) -> Option<u64> {
        let rebased = match state.log.unseen_since(held.base_revision) {
            Ok(unseen) => rebase(held, &unseen),
            // Base pruned since the conflict was recorded: clamp only.
            Err(_) => held.clone(),
        };
        let effective = clamp_operation(&rebased, &state.document)?;
        match state.document.apply(&effective) {
            Ok(revision) => {
                self.finish_apply(state, session, effective, revision);
                Some(revision)
            }
            Err(e) => {
                log::warn!("Conflict winner {} could not be materialized: {e}", held.id);
                None
            }
        }
    }

    /// Apply caller-supplied merged content as a whole-line replace.
    fn materialize_merge(
        &self,
        state: &mut ProjectState,
        session: Option<&Session>,
        line: u32,
        text: &str,
        author: Uuid,
    ) -> Option<u64> {
        let last_line = state.document.line_count().saturating_sub(1) as u32;
        let line = line.min(last_line);
        let line_len = state.document.line_len(line).unwrap_or(0);
        let base = state.log.head();

        let op = if line_len == 0 {
            if text.is_empty() {
                return None;
            }
            Operation::new(author, OpKind::Insert { text: text.to_string() }, Position::new(line, 0), base)
        } else {
            Operation::new(
                author,
                OpKind::Replace { length: Some(line_len), text: text.to_string() },
                Position::new(line, 0),
                base,
            )
        };

        match state.document.apply(&op) {
            Ok(revision) => {
                self.finish_apply(state, session, op, revision);
                Some(revision)
            }
            Err(e) => {
                log::warn!("Merged content for line {line} could not be applied: {e}");
                None
            }
        }
    }

    /// Post-apply bookkeeping: log append, broadcast, audit, version
    /// triggers. The document mutation already happened.
    fn finish_apply(
        &self,
        state: &mut ProjectState,
        session: Option<&Session>,
        effective: Operation,
        revision: u64,
    ) {
        let entry = state.log.append(effective);
        debug_assert_eq!(entry.revision, revision);
        let op = entry.operation;

        self.counters.operations_applied.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Applied {} {} at revision {revision} on project {}",
            op.kind.tag(),
            op.id,
            state.document.project_id()
        );

        self.activity.record(ActivityEvent::OperationApplied {
            project_id: state.document.project_id(),
            operation_id: op.id,
            author_id: op.author_id,
            revision,
        });
        if let Some(session) = session {
            session.broadcast.publish(SessionEvent::OperationApplied {
                project_id: state.document.project_id(),
                revision,
                operation: op.clone(),
            });
        }

        if let Some(version) = state.versions.record_applied(&state.document, op.author_id) {
            if let Some(session) = session {
                session.broadcast.publish(SessionEvent::VersionCreated {
                    project_id: version.project_id,
                    version_id: version.id,
                    revision: version.revision,
                });
            }
            self.activity.record(ActivityEvent::VersionCreated {
                project_id: version.project_id,
                version_id: version.id,
                revision: version.revision,
            });
        }
    }

    /// Content of the line a conflict was fought over (or the whole
    /// document for a rollback replace), after settlement.
    fn content_after(state: &ProjectState, held: &Operation) -> String {
        if held.kind.is_document_replace() {
            return state.document.content();
        }
        let last_line = state.document.line_count().saturating_sub(1) as u32;
        let line = held.position.line.min(last_line);
        state.document.line(line).unwrap_or_default().to_string()
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictStatus;
    use crate::services::{MemorySink, NullSink, Role, StaticMembership};
    use std::time::Duration;

    struct Fixture {
        engine: SessionCoordinator,
        membership: Arc<StaticMembership>,
        workspace: Uuid,
        project: Uuid,
        alice: Uuid,
        bob: Uuid,
    }

    fn fixture_with(policy: ConflictPolicy) -> Fixture {
        let membership = Arc::new(StaticMembership::new());
        let workspace = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        membership.grant(workspace, alice, Role::Editor);
        membership.grant(workspace, bob, Role::Editor);

        let mut config = EngineConfig::for_testing();
        config.conflict.policy = policy;

        let engine =
            SessionCoordinator::new(membership.clone(), Arc::new(NullSink), config);
        Fixture { engine, membership, workspace, project: Uuid::new_v4(), alice, bob }
    }

    fn fixture() -> Fixture {
        fixture_with(ConflictPolicy::Manual)
    }

    async fn seeded(f: &Fixture, content: &str) -> Uuid {
        f.engine.open_project(f.project, content).await;
        let joined = f.engine.join(f.workspace, f.project, f.alice).await.unwrap();
        f.engine.join(f.workspace, f.project, f.bob).await.unwrap();
        joined.session_id
    }

    fn insert(author: Uuid, text: &str, line: u32, col: u32, base: u64, ts: u64) -> Operation {
        Operation::with_timestamp(
            author,
            OpKind::Insert { text: text.into() },
            Position::new(line, col),
            base,
            ts,
        )
    }

    fn replace(
        author: Uuid,
        len: u32,
        text: &str,
        line: u32,
        col: u32,
        base: u64,
        ts: u64,
    ) -> Operation {
        Operation::with_timestamp(
            author,
            OpKind::Replace { length: Some(len), text: text.into() },
            Position::new(line, col),
            base,
            ts,
        )
    }

    #[tokio::test]
    async fn test_join_requires_membership() {
        let f = fixture();
        let stranger = Uuid::new_v4();
        let err = f.engine.join(f.workspace, f.project, stranger).await.unwrap_err();
        assert_eq!(err, EngineError::PermissionDenied { user_id: stranger });
    }

    #[tokio::test]
    async fn test_join_creates_session_and_project() {
        let f = fixture();
        let a = f.engine.join(f.workspace, f.project, f.alice).await.unwrap();
        let b = f.engine.join(f.workspace, f.project, f.bob).await.unwrap();
        assert_eq!(a.session_id, b.session_id);

        let participants = f.engine.participants(a.session_id).await.unwrap();
        assert_eq!(participants.len(), 2);
        assert_eq!(f.engine.content(f.project).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_submit_applies_and_broadcasts() {
        let f = fixture();
        let session = seeded(&f, "hello world").await;
        let mut events = f.engine.join(f.workspace, f.project, f.alice).await.unwrap().events;

        let op = insert(f.alice, "big ", 0, 6, 0, 100);
        let outcome = f.engine.submit_operation(session, op).await.unwrap();
        assert_eq!(outcome, OperationOutcome::Applied { revision: 1 });
        assert_eq!(f.engine.content(f.project).await.unwrap(), "hello big world");

        match &*events.recv().await.unwrap() {
            SessionEvent::OperationApplied { revision, .. } => assert_eq!(*revision, 1),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_viewer_cannot_submit() {
        let f = fixture();
        let session = seeded(&f, "content").await;
        let viewer = Uuid::new_v4();
        f.membership.grant(f.workspace, viewer, Role::Viewer);
        f.engine.join(f.workspace, f.project, viewer).await.unwrap();

        let err = f
            .engine
            .submit_operation(session, insert(viewer, "x", 0, 0, 0, 1))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::PermissionDenied { user_id: viewer });
    }

    #[tokio::test]
    async fn test_concurrent_inserts_rebase() {
        // Both edits based at revision 0; the second arrival is shifted
        // past the first one's materialized length.
        let f = fixture();
        let session = seeded(&f, "hello world").await;

        f.engine
            .submit_operation(session, insert(f.alice, ">>> ", 0, 0, 0, 100))
            .await
            .unwrap();
        let outcome = f
            .engine
            .submit_operation(session, insert(f.bob, "big ", 0, 6, 0, 200))
            .await
            .unwrap();

        assert_eq!(outcome, OperationOutcome::Applied { revision: 2 });
        assert_eq!(f.engine.content(f.project).await.unwrap(), ">>> hello big world");
    }

    #[tokio::test]
    async fn test_manual_policy_holds_conflict() {
        let f = fixture();
        let session = seeded(&f, "hello world").await;

        f.engine
            .submit_operation(session, replace(f.alice, 5, "WORLD", 0, 6, 0, 100))
            .await
            .unwrap();
        let outcome = f
            .engine
            .submit_operation(session, replace(f.bob, 5, "earth", 0, 6, 0, 200))
            .await
            .unwrap();

        let OperationOutcome::Conflicted { conflict_id } = outcome else {
            panic!("expected conflict, got {outcome:?}");
        };
        // Held, not applied: document unchanged by the losing submission.
        assert_eq!(f.engine.content(f.project).await.unwrap(), "hello WORLD");

        let conflict = f.engine.conflict(f.project, conflict_id).await.unwrap();
        assert!(conflict.is_pending());
        assert_eq!(conflict.participant_ids.len(), 2);
        assert_eq!(f.engine.pending_conflicts(f.project).await.unwrap(), vec![conflict_id]);
    }

    #[tokio::test]
    async fn test_operation_outcome_reports_pending_then_settled() {
        let f = fixture();
        let session = seeded(&f, "hello world").await;

        f.engine
            .submit_operation(session, replace(f.alice, 5, "WORLD", 0, 6, 0, 100))
            .await
            .unwrap();
        let held = replace(f.bob, 5, "earth", 0, 6, 0, 200);
        let held_id = held.id;
        let OperationOutcome::Conflicted { conflict_id } =
            f.engine.submit_operation(session, held).await.unwrap()
        else {
            panic!("expected conflict");
        };

        let err = f.engine.operation_outcome(f.project, held_id).await.unwrap_err();
        assert_eq!(err, EngineError::ConflictUnresolved { conflict_id });

        f.engine
            .resolve_conflict(
                session,
                conflict_id,
                ResolutionChoice {
                    strategy: ResolutionStrategy::Reject,
                    resolved_by: f.alice,
                    merged_content: None,
                },
            )
            .await
            .unwrap();
        let outcome = f.engine.operation_outcome(f.project, held_id).await.unwrap();
        assert_eq!(outcome, OperationOutcome::Conflicted { conflict_id });

        let unknown = Uuid::new_v4();
        assert_eq!(
            f.engine.operation_outcome(f.project, unknown).await.unwrap_err(),
            EngineError::OperationNotFound { operation_id: unknown }
        );
    }

    #[tokio::test]
    async fn test_auto_policy_later_timestamp_wins() {
        let f = fixture_with(ConflictPolicy::Auto);
        let session = seeded(&f, "hello world").await;

        f.engine
            .submit_operation(session, replace(f.alice, 5, "WORLD", 0, 6, 0, 100))
            .await
            .unwrap();
        let outcome = f
            .engine
            .submit_operation(session, replace(f.bob, 5, "earth", 0, 6, 0, 200))
            .await
            .unwrap();

        let OperationOutcome::Conflicted { conflict_id } = outcome else {
            panic!("expected conflict record even under auto policy");
        };
        let conflict = f.engine.conflict(f.project, conflict_id).await.unwrap();
        assert_eq!(conflict.status, ConflictStatus::Resolved);
        let resolution = conflict.resolution.unwrap();
        assert_eq!(resolution.strategy, ResolutionStrategy::Accept);
        assert_eq!(f.engine.content(f.project).await.unwrap(), "hello earth");
    }

    #[tokio::test]
    async fn test_auto_policy_earlier_timestamp_loses() {
        let f = fixture_with(ConflictPolicy::Auto);
        let session = seeded(&f, "hello world").await;

        f.engine
            .submit_operation(session, replace(f.alice, 5, "WORLD", 0, 6, 0, 200))
            .await
            .unwrap();
        let OperationOutcome::Conflicted { conflict_id } = f
            .engine
            .submit_operation(session, replace(f.bob, 5, "earth", 0, 6, 0, 100))
            .await
            .unwrap()
        else {
            panic!("expected conflict");
        };

        let conflict = f.engine.conflict(f.project, conflict_id).await.unwrap();
        let resolution = conflict.resolution.clone().unwrap();
        assert_eq!(resolution.strategy, ResolutionStrategy::Reject);
        assert_eq!(resolution.resolved_by, f.alice);
        // Losing content is discarded but the loser is named.
        assert_eq!(conflict.losers(f.alice), vec![f.bob]);
        assert_eq!(f.engine.content(f.project).await.unwrap(), "hello WORLD");
    }

    #[tokio::test]
    async fn test_manual_accept_materializes_held() {
        let f = fixture();
        let session = seeded(&f, "hello world").await;

        f.engine
            .submit_operation(session, replace(f.alice, 5, "WORLD", 0, 6, 0, 100))
            .await
            .unwrap();
        let OperationOutcome::Conflicted { conflict_id } = f
            .engine
            .submit_operation(session, replace(f.bob, 5, "earth", 0, 6, 0, 200))
            .await
            .unwrap()
        else {
            panic!("expected conflict");
        };

        f.engine
            .resolve_conflict(
                session,
                conflict_id,
                ResolutionChoice {
                    strategy: ResolutionStrategy::Accept,
                    resolved_by: f.bob,
                    merged_content: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(f.engine.content(f.project).await.unwrap(), "hello earth");

        // Second resolution attempt is a no-op, not an error.
        f.engine
            .resolve_conflict(
                session,
                conflict_id,
                ResolutionChoice {
                    strategy: ResolutionStrategy::Reject,
                    resolved_by: f.alice,
                    merged_content: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(f.engine.content(f.project).await.unwrap(), "hello earth");
    }

    #[tokio::test]
    async fn test_manual_merge_applies_supplied_content() {
        let f = fixture();
        let session = seeded(&f, "hello world").await;

        f.engine
            .submit_operation(session, replace(f.alice, 5, "WORLD", 0, 6, 0, 100))
            .await
            .unwrap();
        let OperationOutcome::Conflicted { conflict_id } = f
            .engine
            .submit_operation(session, replace(f.bob, 5, "earth", 0, 6, 0, 200))
            .await
            .unwrap()
        else {
            panic!("expected conflict");
        };

        // Merge without content is malformed.
        let err = f
            .engine
            .resolve_conflict(
                session,
                conflict_id,
                ResolutionChoice {
                    strategy: ResolutionStrategy::Merge,
                    resolved_by: f.bob,
                    merged_content: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidContent { .. }));

        f.engine
            .resolve_conflict(
                session,
                conflict_id,
                ResolutionChoice {
                    strategy: ResolutionStrategy::Merge,
                    resolved_by: f.bob,
                    merged_content: Some("hello WORLD and earth".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(f.engine.content(f.project).await.unwrap(), "hello WORLD and earth");
    }

    #[tokio::test]
    async fn test_ignore_conflict_leaves_document() {
        let f = fixture();
        let session = seeded(&f, "hello world").await;

        f.engine
            .submit_operation(session, replace(f.alice, 5, "WORLD", 0, 6, 0, 100))
            .await
            .unwrap();
        let OperationOutcome::Conflicted { conflict_id } = f
            .engine
            .submit_operation(session, replace(f.bob, 5, "earth", 0, 6, 0, 200))
            .await
            .unwrap()
        else {
            panic!("expected conflict");
        };

        f.engine.ignore_conflict(session, conflict_id, f.bob).await.unwrap();
        let conflict = f.engine.conflict(f.project, conflict_id).await.unwrap();
        assert_eq!(conflict.status, ConflictStatus::Ignored);
        assert_eq!(f.engine.content(f.project).await.unwrap(), "hello WORLD");
    }

    #[tokio::test]
    async fn test_stale_conflict_degrades_to_auto() {
        // for_testing staleness window is 50ms.
        let f = fixture();
        let session = seeded(&f, "hello world").await;

        f.engine
            .submit_operation(session, replace(f.alice, 5, "WORLD", 0, 6, 0, 100))
            .await
            .unwrap();
        let OperationOutcome::Conflicted { conflict_id } = f
            .engine
            .submit_operation(session, replace(f.bob, 5, "earth", 0, 6, 0, 200))
            .await
            .unwrap()
        else {
            panic!("expected conflict");
        };

        tokio::time::sleep(Duration::from_millis(80)).await;
        let expired = f.engine.expire_stale_conflicts(f.project).await.unwrap();
        assert_eq!(expired, 1);

        let conflict = f.engine.conflict(f.project, conflict_id).await.unwrap();
        assert_eq!(conflict.status, ConflictStatus::Resolved);
        // Held op has the later timestamp: degraded auto resolution
        // accepts it.
        assert_eq!(f.engine.content(f.project).await.unwrap(), "hello earth");

        // Second sweep finds nothing: degrade happens exactly once.
        assert_eq!(f.engine.expire_stale_conflicts(f.project).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_conflict_degrades_after_session_teardown() {
        let f = fixture();
        let session = seeded(&f, "hello world").await;

        f.engine
            .submit_operation(session, replace(f.alice, 5, "WORLD", 0, 6, 0, 100))
            .await
            .unwrap();
        let OperationOutcome::Conflicted { conflict_id } = f
            .engine
            .submit_operation(session, replace(f.bob, 5, "earth", 0, 6, 0, 200))
            .await
            .unwrap()
        else {
            panic!("expected conflict");
        };

        // Everyone leaves while the conflict is still pending.
        f.engine.leave(session, f.alice).await.unwrap();
        f.engine.leave(session, f.bob).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(f.engine.expire_stale_conflicts(f.project).await.unwrap(), 1);

        let conflict = f.engine.conflict(f.project, conflict_id).await.unwrap();
        assert_eq!(conflict.status, ConflictStatus::Resolved);
        assert_eq!(f.engine.content(f.project).await.unwrap(), "hello earth");
    }

    #[tokio::test]
    async fn test_suggestions_policy_attaches_preview() {
        let f = fixture_with(ConflictPolicy::Suggestions);
        let session = seeded(&f, "hello world").await;

        f.engine
            .submit_operation(session, replace(f.alice, 5, "WORLD", 0, 6, 0, 100))
            .await
            .unwrap();
        let OperationOutcome::Conflicted { conflict_id } = f
            .engine
            .submit_operation(session, replace(f.bob, 5, "earth", 0, 6, 0, 200))
            .await
            .unwrap()
        else {
            panic!("expected conflict");
        };

        let conflict = f.engine.conflict(f.project, conflict_id).await.unwrap();
        assert!(conflict.is_pending());
        assert_eq!(conflict.suggestion.as_deref(), Some("hello earth"));
    }

    #[tokio::test]
    async fn test_stale_base_revision_rejected() {
        // for_testing log retains 8 entries; 10 appends move the horizon.
        let f = fixture();
        let session = seeded(&f, "x").await;

        for i in 0..10u64 {
            f.engine
                .submit_operation(session, insert(f.alice, "a", 0, 0, i, 100 + i))
                .await
                .unwrap();
        }

        let err = f
            .engine
            .submit_operation(session, insert(f.bob, "b", 0, 0, 0, 500))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::StaleBaseRevision { base: 0, horizon: 2 });

        let ahead = f
            .engine
            .submit_operation(session, insert(f.bob, "b", 0, 0, 99, 501))
            .await
            .unwrap_err();
        assert_eq!(ahead, EngineError::RevisionAhead { base: 99, head: 10 });

        // An edit that is both stale and out of current bounds gets the
        // resync signal, not a spatial error.
        let stale_and_oob = f
            .engine
            .submit_operation(session, insert(f.bob, "b", 99, 0, 0, 502))
            .await
            .unwrap_err();
        assert_eq!(stale_and_oob, EngineError::StaleBaseRevision { base: 0, horizon: 2 });
    }

    #[tokio::test]
    async fn test_oversized_length_rejected_at_submission() {
        let f = fixture();
        let session = seeded(&f, "abc").await;

        let huge_delete = Operation::with_timestamp(
            f.alice,
            OpKind::Delete { length: Some(u32::MAX) },
            Position::new(0, 2),
            0,
            100,
        );
        let err = f.engine.submit_operation(session, huge_delete).await.unwrap_err();
        assert_eq!(err, EngineError::InvalidPosition { line: 0, column: 2 });

        let huge_replace = Operation::with_timestamp(
            f.alice,
            OpKind::Replace { length: Some(u32::MAX), text: "y".into() },
            Position::new(0, 0),
            0,
            101,
        );
        assert!(matches!(
            f.engine.submit_operation(session, huge_replace).await,
            Err(EngineError::InvalidPosition { .. })
        ));

        // Rejected before anything entered the log.
        assert_eq!(f.engine.revision(f.project).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_auto_snapshot_after_op_threshold() {
        // for_testing snapshots every 5 applied operations.
        let f = fixture();
        let session = seeded(&f, "x").await;

        for i in 0..5u64 {
            f.engine
                .submit_operation(session, insert(f.alice, "a", 0, 0, i, 100 + i))
                .await
                .unwrap();
        }
        let versions = f.engine.versions(f.project).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].revision, 5);
    }

    #[tokio::test]
    async fn test_snapshot_diff_rollback_roundtrip() {
        let f = fixture();
        let session = seeded(&f, "alpha\nbeta").await;

        let before = f.engine.snapshot(session, f.alice, vec!["v1".into()]).await.unwrap();
        f.engine
            .submit_operation(session, replace(f.alice, 4, "BETA", 1, 0, 0, 100))
            .await
            .unwrap();
        let after = f.engine.snapshot(session, f.alice, vec![]).await.unwrap();

        let changes = f.engine.diff_versions(f.project, before.id, after.id).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].line, 1);

        let outcome = f.engine.rollback(session, before.id, f.bob).await.unwrap();
        assert!(matches!(outcome, OperationOutcome::Applied { .. }));
        assert_eq!(f.engine.content(f.project).await.unwrap(), "alpha\nbeta");

        // History survives the rollback.
        assert!(f.engine.diff_versions(f.project, before.id, after.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_rollback_unknown_version() {
        let f = fixture();
        let session = seeded(&f, "x").await;
        let missing = Uuid::new_v4();
        let err = f.engine.rollback(session, missing, f.alice).await.unwrap_err();
        assert_eq!(err, EngineError::VersionNotFound { version_id: missing });
    }

    #[tokio::test]
    async fn test_leave_tears_down_session_keeps_project() {
        let f = fixture();
        let session = seeded(&f, "persistent").await;

        f.engine.leave(session, f.alice).await.unwrap();
        f.engine.leave(session, f.bob).await.unwrap();

        assert_eq!(
            f.engine.participants(session).await.unwrap_err(),
            EngineError::SessionNotFound
        );
        // Document state survives; a rejoin gets a fresh session over it.
        assert_eq!(f.engine.content(f.project).await.unwrap(), "persistent");
        let rejoined = f.engine.join(f.workspace, f.project, f.alice).await.unwrap();
        assert_ne!(rejoined.session_id, session);
    }

    #[tokio::test]
    async fn test_join_session_by_id() {
        let f = fixture();
        let joined = f.engine.join(f.workspace, f.project, f.alice).await.unwrap();

        // Rejoin by id refreshes presence without duplicating it.
        f.engine.join_session(joined.session_id, f.alice).await.unwrap();
        f.engine.join_session(joined.session_id, f.bob).await.unwrap();
        assert_eq!(f.engine.participants(joined.session_id).await.unwrap().len(), 2);

        let stranger = Uuid::new_v4();
        assert_eq!(
            f.engine.join_session(joined.session_id, stranger).await.unwrap_err(),
            EngineError::PermissionDenied { user_id: stranger }
        );

        // Torn-down sessions cannot be rejoined by id.
        f.engine.leave(joined.session_id, f.alice).await.unwrap();
        f.engine.leave(joined.session_id, f.bob).await.unwrap();
        assert_eq!(
            f.engine.join_session(joined.session_id, f.alice).await.unwrap_err(),
            EngineError::SessionNotFound
        );
    }

    #[tokio::test]
    async fn test_presence_updates_broadcast() {
        let f = fixture();
        f.engine.open_project(f.project, "text").await;
        let mut joined = f.engine.join(f.workspace, f.project, f.alice).await.unwrap();
        let session = joined.session_id;

        // Own join confirmation arrives first.
        match &*joined.events.recv().await.unwrap() {
            SessionEvent::ParticipantJoined { user_id, .. } => assert_eq!(*user_id, f.alice),
            other => panic!("unexpected event {other:?}"),
        }

        assert!(f.engine.update_cursor(session, f.alice, Position::new(0, 2)).await.unwrap());
        match &*joined.events.recv().await.unwrap() {
            SessionEvent::PresenceUpdated { cursor, .. } => {
                assert_eq!(*cursor, Some(Position::new(0, 2)));
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(f.engine.set_typing(session, f.alice, true).await.unwrap());
        // Unchanged typing state is not re-broadcast.
        assert!(!f.engine.set_typing(session, f.alice, true).await.unwrap());

        // Unknown participants are ignored, not errors.
        assert!(!f.engine.update_cursor(session, Uuid::new_v4(), Position::new(0, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_activity_sink_receives_audit_trail() {
        let membership = Arc::new(StaticMembership::new());
        let sink = Arc::new(MemorySink::new());
        let workspace = Uuid::new_v4();
        let alice = Uuid::new_v4();
        membership.grant(workspace, alice, Role::Editor);

        let engine = SessionCoordinator::new(
            membership,
            sink.clone(),
            EngineConfig::for_testing(),
        );
        let project = Uuid::new_v4();
        engine.open_project(project, "audit me").await;
        let joined = engine.join(workspace, project, alice).await.unwrap();
        engine
            .submit_operation(joined.session_id, insert(alice, "!", 0, 0, 0, 100))
            .await
            .unwrap();

        let events = sink.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ActivityEvent::ParticipantJoined { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ActivityEvent::OperationApplied { revision: 1, .. })));
    }

    #[tokio::test]
    async fn test_stats_track_counters() {
        let f = fixture_with(ConflictPolicy::Auto);
        let session = seeded(&f, "hello world").await;

        f.engine
            .submit_operation(session, replace(f.alice, 5, "WORLD", 0, 6, 0, 100))
            .await
            .unwrap();
        f.engine
            .submit_operation(session, replace(f.bob, 5, "earth", 0, 6, 0, 200))
            .await
            .unwrap();

        let stats = f.engine.stats().await;
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.projects, 1);
        assert_eq!(stats.conflicts_detected, 1);
        assert_eq!(stats.conflicts_resolved, 1);
        // First apply plus the materialized conflict winner.
        assert_eq!(stats.operations_applied, 2);
    }
}
