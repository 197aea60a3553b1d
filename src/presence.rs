//! Ephemeral participant presence: cursors, selections, typing flags.
//!
//! Presence is short-lived in-memory state keyed by session — explicitly
//! not persisted, and cleared when the session is torn down. It never
//! mixes with the durable Operation Log / Version state.
//!
//! Cursor updates are rate-limited per participant (30fps) so a fast
//! typist doesn't flood the broadcast channel; joins, selections, and
//! typing transitions always broadcast immediately.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::document::Position;

/// A contiguous selected region (anchor may follow head).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Selection {
    pub anchor: Position,
    pub head: Position,
}

impl Selection {
    pub fn new(anchor: Position, head: Position) -> Self {
        Self { anchor, head }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }
}

/// Per-session, per-user ephemeral record. Destroyed when the participant
/// disconnects or the session ends.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: Uuid,
    pub cursor: Option<Position>,
    pub selection: Option<Selection>,
    pub is_typing: bool,
    /// Last time we heard anything from this participant.
    pub last_seen: Instant,
    /// Rate limiter for cursor broadcasts.
    last_cursor_broadcast: Instant,
    /// When the typing flag was last raised.
    typing_since: Instant,
}

impl Participant {
    fn new(user_id: Uuid) -> Self {
        let now = Instant::now();
        Self {
            user_id,
            cursor: None,
            selection: None,
            is_typing: false,
            last_seen: now,
            // Allow an immediate first cursor broadcast.
            last_cursor_broadcast: now - Duration::from_secs(1),
            typing_since: now,
        }
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Roster of connected participants for one session.
pub struct PresenceRoster {
    participants: HashMap<Uuid, Participant>,
    /// Minimum interval between cursor broadcasts per participant.
    cursor_interval: Duration,
    /// Idle threshold for sweep-based eviction.
    idle_timeout: Duration,
    /// Typing flag auto-expiry.
    typing_timeout: Duration,
}

impl Default for PresenceRoster {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self {
            participants: HashMap::new(),
            cursor_interval: Duration::from_millis(33), // 30fps
            idle_timeout: Duration::from_secs(30),
            typing_timeout: Duration::from_secs(5),
        }
    }

    /// Roster with a custom cursor throttle (for testing).
    pub fn with_cursor_interval(interval: Duration) -> Self {
        let mut roster = Self::new();
        roster.cursor_interval = interval;
        roster
    }

    /// Add a participant. Idempotent: re-joining refreshes `last_seen`
    /// and returns false.
    pub fn join(&mut self, user_id: Uuid) -> bool {
        match self.participants.get_mut(&user_id) {
            Some(existing) => {
                existing.last_seen = Instant::now();
                false
            }
            None => {
                self.participants.insert(user_id, Participant::new(user_id));
                true
            }
        }
    }

    /// Remove a participant. Returns true if they were present.
    pub fn leave(&mut self, user_id: Uuid) -> bool {
        self.participants.remove(&user_id).is_some()
    }

    /// Update a cursor position. Returns true when the update should be
    /// broadcast (rate limit elapsed), false when throttled or unknown.
    pub fn update_cursor(&mut self, user_id: Uuid, cursor: Position) -> bool {
        let interval = self.cursor_interval;
        let Some(p) = self.participants.get_mut(&user_id) else {
            return false;
        };
        p.cursor = Some(cursor);
        p.last_seen = Instant::now();

        if p.last_cursor_broadcast.elapsed() < interval {
            return false; // throttled
        }
        p.last_cursor_broadcast = Instant::now();
        true
    }

    /// Update a selection. Always broadcast-worthy on change.
    pub fn update_selection(&mut self, user_id: Uuid, selection: Option<Selection>) -> bool {
        let Some(p) = self.participants.get_mut(&user_id) else {
            return false;
        };
        p.selection = selection;
        p.last_seen = Instant::now();
        true
    }

    /// Raise or clear the typing flag. Returns true on a state change.
    pub fn set_typing(&mut self, user_id: Uuid, typing: bool) -> bool {
        let Some(p) = self.participants.get_mut(&user_id) else {
            return false;
        };
        p.last_seen = Instant::now();
        if typing {
            p.typing_since = Instant::now();
        }
        let changed = p.is_typing != typing;
        p.is_typing = typing;
        changed
    }

    /// Refresh a participant's liveness without other changes.
    pub fn touch(&mut self, user_id: Uuid) {
        if let Some(p) = self.participants.get_mut(&user_id) {
            p.last_seen = Instant::now();
        }
    }

    /// Clear typing flags that outlived the typing timeout.
    pub fn expire_typing(&mut self) -> Vec<Uuid> {
        let timeout = self.typing_timeout;
        let mut cleared = Vec::new();
        for p in self.participants.values_mut() {
            if p.is_typing && p.typing_since.elapsed() > timeout {
                p.is_typing = false;
                cleared.push(p.user_id);
            }
        }
        cleared
    }

    /// Evict participants idle beyond the timeout. Returns evicted ids.
    pub fn cleanup_idle(&mut self) -> Vec<Uuid> {
        let timeout = self.idle_timeout;
        let stale: Vec<Uuid> = self
            .participants
            .values()
            .filter(|p| p.is_idle(timeout))
            .map(|p| p.user_id)
            .collect();
        for id in &stale {
            self.participants.remove(id);
        }
        stale
    }

    pub fn get(&self, user_id: Uuid) -> Option<&Participant> {
        self.participants.get(&user_id)
    }

    pub fn contains(&self, user_id: Uuid) -> bool {
        self.participants.contains_key(&user_id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn user_ids(&self) -> Vec<Uuid> {
        self.participants.keys().copied().collect()
    }
}
