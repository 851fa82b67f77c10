//! Presence and cursor awareness for real-time collaboration.
//!
//! Presence is ephemeral state that never enters the update log: who is in a
//! document, which color they were given and where their cursor sits. Cursors
//! are [`StableCursor`]s anchored to content, so a peer resolves them against
//! its own replica and they do not drift under concurrent edits. Each
//! session owns one register. A newer record from a session replaces the
//! previous one for every observer, and a session disappears when it
//! disconnects or stops refreshing within the liveness window.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::document::StableCursor;
use super::SessionId;

/// Default liveness window for a presence record
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest display name accepted from a peer
pub const MAX_NAME_LEN: usize = 64;

/// Presence payload, schema version 1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresenceV1 {
    /// Display name
    pub name: String,
    /// Assigned color (`#rrggbb`)
    pub color: String,
    /// Caret position
    pub cursor: Option<StableCursor>,
    /// Other end of the selection, if selecting
    pub selection_end: Option<StableCursor>,
}

/// Versioned presence record. New schema versions are added as variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceRecord {
    V1(PresenceV1),
}

impl PresenceRecord {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        PresenceRecord::V1(PresenceV1 {
            name: name.into(),
            color: color.into(),
            cursor: None,
            selection_end: None,
        })
    }

    pub fn with_cursor(self, cursor: Option<StableCursor>, selection_end: Option<StableCursor>) -> Self {
        match self {
            PresenceRecord::V1(v1) => PresenceRecord::V1(PresenceV1 {
                cursor,
                selection_end: selection_end.filter(|_| cursor.is_some()),
                ..v1
            }),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PresenceRecord::V1(v1) => &v1.name,
        }
    }

    pub fn color(&self) -> &str {
        match self {
            PresenceRecord::V1(v1) => &v1.color,
        }
    }

    pub fn cursor(&self) -> Option<StableCursor> {
        match self {
            PresenceRecord::V1(v1) => v1.cursor,
        }
    }

    pub fn selection_end(&self) -> Option<StableCursor> {
        match self {
            PresenceRecord::V1(v1) => v1.selection_end,
        }
    }

    /// Check the required fields carry usable values.
    pub fn validate(&self) -> Result<(), PresenceError> {
        match self {
            PresenceRecord::V1(v1) => {
                if v1.name.trim().is_empty() || v1.name.chars().count() > MAX_NAME_LEN {
                    return Err(PresenceError::MalformedRecord(format!(
                        "invalid display name of {} chars",
                        v1.name.chars().count()
                    )));
                }
                if !is_hex_color(&v1.color) {
                    return Err(PresenceError::MalformedRecord(format!(
                        "invalid color {:?}",
                        v1.color
                    )));
                }
                if v1.selection_end.is_some() && v1.cursor.is_none() {
                    return Err(PresenceError::MalformedRecord(
                        "selection without cursor".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Whether `color` is a `#rrggbb` hex color
pub fn is_hex_color(color: &str) -> bool {
    color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// One presence change as it travels between peers.
///
/// `clock` increases with every change a session makes so receivers can drop
/// stale copies. A `None` record announces that the session left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub session_id: SessionId,
    pub clock: u64,
    pub record: Option<PresenceRecord>,
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    record: PresenceRecord,
    clock: u64,
    last_seen: Instant,
}

/// Errors related to presence operations
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("Malformed presence record: {0}")]
    MalformedRecord(String),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Encoding error: {0}")]
    Encode(#[from] bincode::Error),
}

/// Per-document presence register with liveness expiry
#[derive(Debug)]
pub struct PresenceChannel {
    sessions: DashMap<SessionId, PresenceEntry>,
    timeout: Duration,
}

impl Default for PresenceChannel {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TIMEOUT)
    }
}

impl PresenceChannel {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Replace the record for a session, returning the update to broadcast.
    pub fn publish(&self, session_id: &str, record: PresenceRecord) -> PresenceUpdate {
        let now = Instant::now();
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| PresenceEntry {
                record: record.clone(),
                clock: 0,
                last_seen: now,
            });
        entry.record = record.clone();
        entry.clock += 1;
        entry.last_seen = now;

        PresenceUpdate {
            session_id: session_id.to_string(),
            clock: entry.clock,
            record: Some(record),
        }
    }

    /// Move a session's cursor, keeping its identity.
    pub fn set_cursor(
        &self,
        session_id: &str,
        cursor: Option<StableCursor>,
        selection_end: Option<StableCursor>,
    ) -> Result<PresenceUpdate, PresenceError> {
        let record = self
            .sessions
            .get(session_id)
            .map(|e| e.record.clone())
            .ok_or_else(|| PresenceError::SessionNotFound(session_id.to_string()))?;
        Ok(self.publish(session_id, record.with_cursor(cursor, selection_end)))
    }

    /// Remove a session, returning the removal to broadcast if it was present.
    pub fn expire(&self, session_id: &str) -> Option<PresenceUpdate> {
        self.sessions.remove(session_id).map(|(session_id, entry)| {
            debug!("Presence expired for session {}", session_id);
            PresenceUpdate {
                session_id,
                clock: entry.clock + 1,
                record: None,
            }
        })
    }

    /// Liveness heartbeat without changing the record.
    pub fn refresh(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Expire every session not seen within the liveness window before `now`.
    pub fn prune_expired(&self, now: Instant) -> Vec<PresenceUpdate> {
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| now.saturating_duration_since(e.last_seen) > self.timeout)
            .map(|e| e.key().clone())
            .collect();

        stale.iter().filter_map(|id| self.expire(id)).collect()
    }

    /// Merge one update received from a peer. Returns false when it was
    /// stale or unchanged.
    pub fn apply(&self, update: PresenceUpdate, now: Instant) -> bool {
        let current = self.sessions.get(&update.session_id).map(|e| e.clock);
        if current.is_some_and(|clock| clock >= update.clock) {
            return false;
        }

        match update.record {
            Some(record) => {
                self.sessions.insert(
                    update.session_id,
                    PresenceEntry {
                        record,
                        clock: update.clock,
                        last_seen: now,
                    },
                );
                true
            }
            None => self.sessions.remove(&update.session_id).is_some(),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<PresenceRecord> {
        self.sessions.get(session_id).map(|e| e.record.clone())
    }

    /// Current records, ordered by session id.
    pub fn list(&self) -> Vec<PresenceUpdate> {
        let mut list: Vec<PresenceUpdate> = self
            .sessions
            .iter()
            .map(|e| PresenceUpdate {
                session_id: e.key().clone(),
                clock: e.clock,
                record: Some(e.record.clone()),
            })
            .collect();
        list.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        list
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Encode every live record.
    pub fn serialize_presence(&self) -> Result<Vec<u8>, PresenceError> {
        encode_updates(&self.list())
    }

    /// Decode and merge a presence payload, returning the updates that took
    /// effect.
    pub fn apply_presence(&self, data: &[u8], now: Instant) -> Result<Vec<PresenceUpdate>, PresenceError> {
        let updates = decode_updates(data)?;
        Ok(updates
            .into_iter()
            .filter(|u| self.apply(u.clone(), now))
            .collect())
    }
}

pub fn encode_updates(updates: &[PresenceUpdate]) -> Result<Vec<u8>, PresenceError> {
    Ok(bincode::serialize(updates)?)
}

/// Decode a presence payload, rejecting records with invalid fields.
pub fn decode_updates(data: &[u8]) -> Result<Vec<PresenceUpdate>, PresenceError> {
    let updates: Vec<PresenceUpdate> = bincode::deserialize(data)
        .map_err(|e| PresenceError::MalformedRecord(e.to_string()))?;
    for update in &updates {
        if let Some(record) = &update.record {
            if let Err(e) = record.validate() {
                warn!("Rejecting presence from session {}: {}", update.session_id, e);
                return Err(e);
            }
        }
    }
    Ok(updates)
}

/// Helper to generate a random color for a session
pub fn generate_session_color() -> String {
    use rand::seq::SliceRandom;
    const COLORS: [&str; 12] = [
        "#2563eb", // blue
        "#dc2626", // red
        "#16a34a", // green
        "#d97706", // amber
        "#7c3aed", // violet
        "#db2777", // pink
        "#0891b2", // cyan
        "#ea580c", // orange
        "#0d9488", // teal
        "#65a30d", // lime
        "#4f46e5", // indigo
        "#c026d3", // fuchsia
    ];
    COLORS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(COLORS[0])
        .to_string()
}
