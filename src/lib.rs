//! # coedit — Real-time collaborative document editing engine
//!
//! Multi-participant editing with operational-transform position rebasing,
//! explicit conflict records, and bounded version history.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   submit(op)   ┌────────────────────┐
//! │ Participant │ ─────────────► │ SessionCoordinator │
//! │ (per user)  │ ◄───────────── │ (per project lock) │
//! └──────┬──────┘    events      └─────────┬──────────┘
//!        │                                 │
//!        ▼                       ┌─────────┴─────────┐
//! ┌─────────────┐                ▼                   ▼
//! │ Presence    │        ┌──────────────┐    ┌──────────────┐
//! │ (ephemeral) │        │ DocumentStore│    │ OperationLog │
//! └─────────────┘        │ (lines, rev) │    │ (append-only)│
//!                        └──────┬───────┘    └──────────────┘
//!                               │
//!                        ┌──────┴───────┐
//!                        │ VersionStore │
//!                        │ (LZ4 snaps)  │
//!                        └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`] — Line-addressed content with gapless revisions
//! - [`operation`] — Operations and the checksummed append-only log
//! - [`conflict`] — Detection, OT rebasing, and conflict records
//! - [`version`] — Compressed snapshots, diff, rollback synthesis
//! - [`session`] — The coordinator: the per-project serialization point
//! - [`presence`] — Cursors, selections, typing flags (ephemeral)
//! - [`events`] / [`broadcast`] — Typed outcome fan-out per session
//! - [`services`] — Injected membership and activity-audit seams
//!
//! ## Guarantees
//!
//! | Property | How |
//! |----------|-----|
//! | Per-project serialization | one async mutex per project |
//! | Gapless revisions | assigned under that mutex, log = document |
//! | No silent discard | every operation is applied or held in a Conflict |
//! | Deterministic precedence | `(timestamp, author_id)` total order |
//! | Conflict liveness | staleness window degrades pending → auto |

pub mod broadcast;
pub mod conflict;
pub mod document;
pub mod error;
pub mod events;
pub mod operation;
pub mod presence;
pub mod services;
pub mod session;
pub mod version;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, SessionBroadcast};
pub use conflict::{
    Conflict, ConflictConfig, ConflictPolicy, ConflictResolution, ConflictStatus,
    ResolutionStrategy,
};
pub use document::{DocumentStore, Position};
pub use error::EngineError;
pub use events::SessionEvent;
pub use operation::{LogConfig, LogEntry, OpKind, Operation, OperationLog};
pub use presence::{Participant, PresenceRoster, Selection};
pub use services::{
    ActivityEvent, ActivitySink, MembershipService, MemorySink, NullSink, Role, StaticMembership,
};
pub use session::{
    EngineConfig, EngineStats, JoinedSession, OperationOutcome, ResolutionChoice, Session,
    SessionCoordinator,
};
pub use version::{
    ChangeKind, CompressedContent, Version, VersionChange, VersionPolicy, VersionStore,
};
