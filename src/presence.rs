//! Server-side presence store.
//!
//! One entry per online user, keyed by user id. A user has at most one live
//! socket; a newer connection supersedes the old mapping, and the old
//! socket's teardown is guarded by its connection id so it cannot clobber
//! the successor's entry.
//!
//! The store is a plain map with no interior locking; the server owns it
//! behind a single `RwLock` and completes every read-modify-broadcast
//! sequence before releasing it.

use std::collections::HashMap;
use uuid::Uuid;

use crate::protocol::{now_millis, CursorPos, PresencePatch, UserPresence};

struct PresenceEntry {
    presence: UserPresence,
    /// Connection that owns this entry; used to ignore stale teardowns.
    conn_id: Uuid,
}

/// Result of a group join: what to send to the joiner and what to broadcast.
pub struct JoinOutcome {
    /// Snapshot of every active member of the group, the joiner included.
    pub snapshot: Vec<UserPresence>,
    /// Group the user implicitly left by joining this one, if any.
    pub previous_group: Option<String>,
    pub presence: UserPresence,
}

/// In-memory liveness map for all connected users.
#[derive(Default)]
pub struct PresenceStore {
    users: HashMap<String, PresenceEntry>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user on authenticated connect. An existing entry for the
    /// same user is superseded (new socket wins).
    pub fn connect(
        &mut self,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        conn_id: Uuid,
    ) -> UserPresence {
        let user_id = user_id.into();
        let presence = UserPresence::new(user_id.clone(), user_name);
        self.users.insert(
            user_id,
            PresenceEntry {
                presence: presence.clone(),
                conn_id,
            },
        );
        presence
    }

    /// Remove the user's entry on disconnect. Ignored unless `conn_id` still
    /// owns the entry, so a superseded socket's cleanup is a no-op.
    /// Returns the removed presence (its `group_id` names the room to notify).
    pub fn disconnect(&mut self, user_id: &str, conn_id: Uuid) -> Option<UserPresence> {
        match self.users.get(user_id) {
            Some(entry) if entry.conn_id == conn_id => {
                self.users.remove(user_id).map(|e| e.presence)
            }
            _ => None,
        }
    }

    /// Whether `conn_id` currently owns the user's entry.
    pub fn owns(&self, user_id: &str, conn_id: Uuid) -> bool {
        self.users
            .get(user_id)
            .map_or(false, |e| e.conn_id == conn_id)
    }

    /// Move the user into a group. Returns the joiner's snapshot of active
    /// members and the group they implicitly left, if any.
    pub fn join_group(&mut self, user_id: &str, group_id: &str) -> Option<JoinOutcome> {
        let previous_group = {
            let entry = self.users.get_mut(user_id)?;
            let previous = entry
                .presence
                .group_id
                .take()
                .filter(|g| g.as_str() != group_id);
            entry.presence.group_id = Some(group_id.to_string());
            entry.presence.is_active = true;
            entry.presence.last_seen = now_millis();
            previous
        };
        let presence = self.users.get(user_id).map(|e| e.presence.clone())?;
        Some(JoinOutcome {
            snapshot: self.members_of(group_id),
            previous_group,
            presence,
        })
    }

    /// Clear the user's group membership if it matches `group_id`.
    pub fn leave_group(&mut self, user_id: &str, group_id: &str) -> Option<UserPresence> {
        let entry = self.users.get_mut(user_id)?;
        if entry.presence.group_id.as_deref() != Some(group_id) {
            return None;
        }
        entry.presence.group_id = None;
        entry.presence.last_seen = now_millis();
        Some(entry.presence.clone())
    }

    /// Apply a partial presence update.
    pub fn apply_patch(&mut self, user_id: &str, patch: &PresencePatch) -> Option<UserPresence> {
        let entry = self.users.get_mut(user_id)?;
        if let Some(cursor) = patch.cursor {
            entry.presence.cursor = Some(cursor);
        }
        if let Some(ref tool) = patch.current_tool {
            entry.presence.current_tool = Some(tool.clone());
        }
        if let Some(active) = patch.is_active {
            entry.presence.is_active = active;
        }
        entry.presence.last_seen = now_millis();
        Some(entry.presence.clone())
    }

    pub fn update_cursor(&mut self, user_id: &str, cursor: CursorPos) -> Option<UserPresence> {
        let entry = self.users.get_mut(user_id)?;
        entry.presence.cursor = Some(cursor);
        entry.presence.last_seen = now_millis();
        Some(entry.presence.clone())
    }

    pub fn change_tool(&mut self, user_id: &str, tool: &str) -> Option<UserPresence> {
        let entry = self.users.get_mut(user_id)?;
        entry.presence.current_tool = Some(tool.to_string());
        entry.presence.last_seen = now_millis();
        Some(entry.presence.clone())
    }

    /// Record liveness from a heartbeat. Reactivates a swept entry, so the
    /// next sweep period starts fresh.
    pub fn touch(&mut self, user_id: &str) -> Option<UserPresence> {
        let entry = self.users.get_mut(user_id)?;
        entry.presence.last_seen = now_millis();
        entry.presence.is_active = true;
        Some(entry.presence.clone())
    }

    pub fn get(&self, user_id: &str) -> Option<&UserPresence> {
        self.users.get(user_id).map(|e| &e.presence)
    }

    /// Active members of a group.
    pub fn members_of(&self, group_id: &str) -> Vec<UserPresence> {
        self.users
            .values()
            .filter(|e| e.presence.is_active && e.presence.group_id.as_deref() == Some(group_id))
            .map(|e| e.presence.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Demote every active entry not seen within `threshold_ms`.
    /// Each stale entry flips active→inactive exactly once and is returned
    /// so the owning room can be notified; already-inactive entries are
    /// skipped, so one staleness period yields one notification.
    pub fn sweep_stale(&mut self, threshold_ms: u64) -> Vec<UserPresence> {
        self.sweep_stale_at(now_millis(), threshold_ms)
    }

    /// Sweep with an explicit clock, for deterministic tests.
    pub fn sweep_stale_at(&mut self, now_ms: u64, threshold_ms: u64) -> Vec<UserPresence> {
        let mut demoted = Vec::new();
        for entry in self.users.values_mut() {
            if entry.presence.is_active
                && now_ms.saturating_sub(entry.presence.last_seen) > threshold_ms
            {
                entry.presence.is_active = false;
                demoted.push(entry.presence.clone());
            }
        }
        demoted
    }
}
