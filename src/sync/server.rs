//! SyncServer implementation for managing concurrent document rooms.
//!
//! This module implements the server side of the collaboration protocol:
//! - DashMap registries for document rooms and connected sessions
//! - One server-side [`CollabDocument`] replica per open document
//! - State vector reconciliation and live update relay
//! - Presence relay with liveness expiry
//!
//! Concurrent edits need no server arbitration: every session's updates are
//! merged into the room replica, which converges regardless of arrival order,
//! and relayed to the other sessions only when they carried something new.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::clock::{ReplicaId, StateVector};
use super::document::{ApplyOutcome, CollabDocument, DocumentError};
use super::presence::{
    self, generate_session_color, PresenceChannel, PresenceRecord, PresenceUpdate,
};
use super::protocol::{ErrorCode, ServerMessage, SyncProtocol, PROTOCOL_VERSION};
use super::sequence::Block;
use super::update::SyncDelta;
use super::{DocumentId, SessionId, SyncError, SyncResult};
use crate::storage::{DocumentMetadata, DocumentStore, StorageError};

/// Title given to documents created without one
pub const DEFAULT_TITLE: &str = "Untitled document";

/// Configuration for the SyncServer
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    /// Maximum sessions joined to one document
    pub max_sessions_per_document: usize,
    /// Document auto-save interval
    pub save_interval: Duration,
    /// Cleanup interval for stale data
    pub cleanup_interval: Duration,
    /// Presence liveness window
    pub presence_timeout: Duration,
    /// Idle time after which a session is dropped, and how long a released
    /// session token stays resumable
    pub session_timeout: Duration,
    /// How long an empty room stays loaded
    pub room_grace_period: Duration,
    /// Reclaim tombstones every known replica has observed
    pub compaction_enabled: bool,
    /// Budget for the update record in one `SyncStep2` frame; larger deltas
    /// are split across several frames
    pub sync_chunk_bytes: u64,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_document: 50,
            save_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(15),
            presence_timeout: presence::DEFAULT_PRESENCE_TIMEOUT,
            session_timeout: Duration::from_secs(300),
            room_grace_period: Duration::from_secs(60),
            compaction_enabled: false,
            sync_chunk_bytes: 1 << 20,
        }
    }
}

/// Identity a client announces in its `Hello`
#[derive(Debug, Clone, Default)]
pub struct SessionHello {
    pub replica_id: Option<ReplicaId>,
    pub name: String,
    pub color: Option<String>,
    pub session_token: Option<String>,
}

/// A single connected session
pub struct SessionConnection {
    pub session_id: SessionId,
    pub document_id: DocumentId,
    pub name: String,
    pub color: String,
    pub session_token: String,
    /// Replica the client edits through, if it told us
    pub replica: Option<ReplicaId>,
    /// Channel to send messages to this session
    tx: mpsc::UnboundedSender<ServerMessage>,
    last_active: Instant,
    joined: bool,
}

impl SessionConnection {
    /// Send a message to this session
    pub fn send(&self, msg: ServerMessage) -> Result<(), SyncError> {
        self.tx
            .send(msg)
            .map_err(|_| SyncError::ConnectionError("Channel closed".to_string()))
    }

    /// Update last activity timestamp
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Check if the connection has been idle longer than `timeout`
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_active) > timeout
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }
}

/// Token bookkeeping so a reconnecting client keeps its session id and color.
/// A token only resumes on the document it was issued for.
#[derive(Debug, Clone)]
struct ResumableSession {
    session_id: SessionId,
    document_id: DocumentId,
    color: String,
    released_at: Option<Instant>,
}

/// Result of asking a room to take one more session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Admitted,
    Full,
    /// The room was evicted or deleted; look it up again
    Closed,
}

/// An open document: the server replica, joined sessions and their presence
struct DocumentRoom {
    document_id: DocumentId,
    /// The server-side replica (protected by mutex for atomic merges)
    document: Mutex<CollabDocument>,
    /// Joined sessions and when they joined
    sessions: DashMap<SessionId, Instant>,
    presence: PresenceChannel,
    /// Set while the room has no sessions
    empty_since: RwLock<Option<Instant>>,
    /// Whether the document has unsaved changes
    dirty: RwLock<bool>,
    /// Held while the session set changes. Set once the room leaves the
    /// registry; a closed room admits nobody.
    closed: Mutex<bool>,
}

impl DocumentRoom {
    fn new(document_id: impl Into<String>, document: CollabDocument, presence_timeout: Duration) -> Self {
        Self {
            document_id: document_id.into(),
            document: Mutex::new(document),
            sessions: DashMap::new(),
            presence: PresenceChannel::new(presence_timeout),
            empty_since: RwLock::new(Some(Instant::now())),
            dirty: RwLock::new(false),
            closed: Mutex::new(false),
        }
    }

    /// Add a session unless the room is closed or already holds `max`.
    fn admit(&self, session_id: &str, max: usize) -> Admission {
        let closed = self.closed.lock();
        if *closed {
            return Admission::Closed;
        }
        if !self.sessions.contains_key(session_id) && self.sessions.len() >= max {
            return Admission::Full;
        }
        self.sessions.insert(session_id.to_string(), Instant::now());
        *self.empty_since.write() = None;
        Admission::Admitted
    }

    fn remove_session(&self, session_id: &str) -> bool {
        let _closed = self.closed.lock();
        let removed = self.sessions.remove(session_id).is_some();
        if removed && self.sessions.is_empty() {
            *self.empty_since.write() = Some(Instant::now());
        }
        removed
    }

    fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|r| r.key().clone()).collect()
    }

    /// Whether the room has been empty for longer than `grace` at `now`
    fn is_idle(&self, now: Instant, grace: Duration) -> bool {
        self.sessions.is_empty()
            && self
                .empty_since
                .read()
                .is_some_and(|since| now.saturating_duration_since(since) > grace)
    }

    /// Close the room if it is idle with nothing left to save.
    fn close_if_idle(&self, now: Instant, grace: Duration) -> bool {
        let mut closed = self.closed.lock();
        if !*closed && self.is_idle(now, grace) && !self.is_dirty() {
            *closed = true;
        }
        *closed
    }

    /// Close the room unconditionally, returning the sessions it held.
    fn close(&self) -> Vec<SessionId> {
        *self.closed.lock() = true;
        self.session_ids()
    }

    fn is_dirty(&self) -> bool {
        *self.dirty.read()
    }

    /// Mark the document as dirty (needs saving)
    fn mark_dirty(&self) {
        *self.dirty.write() = true;
    }

    /// Check and clear dirty flag
    fn take_dirty(&self) -> bool {
        std::mem::take(&mut *self.dirty.write())
    }
}

/// Everything the REST layer shows about one document
#[derive(Debug, Clone, Serialize)]
pub struct DocumentSnapshot {
    pub metadata: DocumentMetadata,
    pub text: String,
    pub blocks: Vec<Block>,
    pub presence: Vec<PresenceUpdate>,
}

/// What one cleanup pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub expired_presence: usize,
    pub stale_sessions: usize,
    pub evicted_rooms: usize,
    pub compacted_items: usize,
}

/// The main synchronization server
pub struct SyncServer {
    config: SyncServerConfig,
    /// Open document rooms
    rooms: DashMap<DocumentId, Arc<DocumentRoom>>,
    /// Connected sessions
    sessions: DashMap<SessionId, Arc<RwLock<SessionConnection>>>,
    /// Session token to resumable session
    tokens: DashMap<String, ResumableSession>,
    storage: Arc<DocumentStore>,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    /// Create a new sync server
    pub fn new(storage: DocumentStore, config: SyncServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            rooms: DashMap::new(),
            sessions: DashMap::new(),
            tokens: DashMap::new(),
            storage: Arc::new(storage),
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    /// Create with default configuration
    pub fn with_storage(storage: DocumentStore) -> Self {
        Self::new(storage, SyncServerConfig::default())
    }

    pub fn config(&self) -> &SyncServerConfig {
        &self.config
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Handle a client `Hello`: register the session (resuming it when the
    /// token is known) and build the `Welcome` reply.
    pub fn hello(
        &self,
        document_id: &str,
        hello: SessionHello,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> SyncResult<(SessionId, ServerMessage)> {
        let restored = hello
            .session_token
            .as_deref()
            .and_then(|token| {
                self.restore_session(token, document_id)
                    .map(|r| (token.to_string(), r))
            });

        let (session_id, session_token, assigned_color) = match restored {
            Some((token, resumed)) => {
                info!("Session restored: {}", resumed.session_id);
                (resumed.session_id, token, resumed.color)
            }
            None => (
                uuid::Uuid::new_v4().to_string(),
                generate_session_token(),
                generate_session_color(),
            ),
        };

        let color = hello
            .color
            .filter(|c| presence::is_hex_color(c))
            .unwrap_or(assigned_color);
        let name = display_name(&hello.name);

        self.register_session(
            &session_id,
            document_id,
            &name,
            &color,
            &session_token,
            hello.replica_id,
            tx,
        )?;

        let welcome = ServerMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            session_id: session_id.clone(),
            color,
            session_token,
            server_time: chrono::Utc::now().timestamp_millis(),
        };
        Ok((session_id, welcome))
    }

    /// Register a new session connection
    #[allow(clippy::too_many_arguments)]
    pub fn register_session(
        &self,
        session_id: &str,
        document_id: &str,
        name: &str,
        color: &str,
        session_token: &str,
        replica: Option<ReplicaId>,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> SyncResult<()> {
        let connection = SessionConnection {
            session_id: session_id.to_string(),
            document_id: document_id.to_string(),
            name: name.to_string(),
            color: color.to_string(),
            session_token: session_token.to_string(),
            replica,
            tx,
            last_active: Instant::now(),
            joined: false,
        };

        self.sessions
            .insert(session_id.to_string(), Arc::new(RwLock::new(connection)));
        self.tokens.insert(
            session_token.to_string(),
            ResumableSession {
                session_id: session_id.to_string(),
                document_id: document_id.to_string(),
                color: color.to_string(),
                released_at: None,
            },
        );

        info!("Session registered: {} ({}) for document {}", name, session_id, document_id);
        Ok(())
    }

    /// Unregister a session, leaving its document
    pub fn unregister_session(&self, session_id: &str) {
        if self.is_joined(session_id) {
            if let Err(e) = self.leave_document(session_id) {
                warn!("Failed to leave document for {}: {}", session_id, e);
            }
        }

        if let Some((_, session)) = self.sessions.remove(session_id) {
            let session = session.read();
            if let Some(mut token) = self.tokens.get_mut(&session.session_token) {
                token.released_at = Some(Instant::now());
            }
            info!("Session unregistered: {} ({})", session.name, session_id);
        }
    }

    /// Look up a released session by token. Tokens of sessions that are
    /// still connected, or that were issued for another document, are not
    /// resumable.
    fn restore_session(&self, session_token: &str, document_id: &str) -> Option<ResumableSession> {
        self.tokens
            .get(session_token)
            .filter(|r| {
                r.document_id == document_id
                    && r.released_at.is_some()
                    && !self.sessions.contains_key(&r.session_id)
            })
            .map(|r| r.clone())
    }

    /// Get a session connection
    pub fn get_session(&self, session_id: &str) -> Option<Arc<RwLock<SessionConnection>>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    fn session(&self, session_id: &str) -> SyncResult<Arc<RwLock<SessionConnection>>> {
        self.get_session(session_id)
            .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()))
    }

    fn is_joined(&self, session_id: &str) -> bool {
        self.get_session(session_id)
            .is_some_and(|s| s.read().is_joined())
    }

    /// The room a joined session is editing; also counts as session activity.
    fn joined_room(&self, session_id: &str) -> SyncResult<Arc<DocumentRoom>> {
        let session = self.session(session_id)?;
        let document_id = {
            let mut session = session.write();
            if !session.joined {
                return Err(SyncError::NotJoined(session_id.to_string()));
            }
            session.touch();
            session.document_id.clone()
        };
        self.rooms
            .get(&document_id)
            .map(|r| r.clone())
            .ok_or(SyncError::DocumentNotFound(document_id))
    }

    // =========================================================================
    // Joining and leaving
    // =========================================================================

    /// Join the session's document. Returns the server's `SyncStep1` and the
    /// current presence snapshot for the joining client.
    pub async fn join_document(&self, session_id: &str) -> SyncResult<Vec<ServerMessage>> {
        let session = self.session(session_id)?;
        let (document_id, name, color) = {
            let s = session.read();
            (s.document_id.clone(), s.name.clone(), s.color.clone())
        };

        let room = loop {
            let room = self.get_or_create_room(&document_id).await?;
            match room.admit(session_id, self.config.max_sessions_per_document) {
                Admission::Admitted => break room,
                Admission::Full => return Err(SyncError::DocumentFull(document_id)),
                Admission::Closed => debug!("Room {} closed while joining; retrying", document_id),
            }
        };
        session.write().joined = true;
        self.record_session_count(&room);

        let update = room.presence.publish(session_id, PresenceRecord::new(name, color));
        self.broadcast_presence(&room, session_id, &[update]);

        let state_vector = room.document.lock().serialize_state_vector()?;
        let snapshot = room.presence.serialize_presence()?;

        info!("Session {} joined document {}", session_id, document_id);

        Ok(vec![
            ServerMessage::SyncStep1 { state_vector },
            ServerMessage::Awareness { payload: snapshot },
        ])
    }

    /// Leave the session's document, expiring its presence
    pub fn leave_document(&self, session_id: &str) -> SyncResult<()> {
        let session = self.session(session_id)?;
        let document_id = {
            let mut s = session.write();
            s.joined = false;
            s.document_id.clone()
        };

        if let Some(room) = self.rooms.get(&document_id).map(|r| r.clone()) {
            room.remove_session(session_id);
            if let Some(removal) = room.presence.expire(session_id) {
                self.broadcast_presence(&room, session_id, &[removal]);
            }
            self.record_session_count(&room);
            info!("Session {} left document {}", session_id, document_id);
        }

        Ok(())
    }

    // =========================================================================
    // Reconciliation and updates
    // =========================================================================

    /// Answer a client `SyncStep1` with everything the client is missing, as
    /// one or more `SyncStep2` messages to be applied in order.
    ///
    /// The reported vector is remembered as a lower bound of what that
    /// replica has seen.
    pub fn handle_sync_step1(&self, session_id: &str, state_vector: &[u8]) -> SyncResult<Vec<ServerMessage>> {
        let room = self.joined_room(session_id)?;
        let vector = StateVector::decode(state_vector)
            .map_err(|e| DocumentError::MalformedRecord(e.to_string()))?;

        let replica = self.session(session_id)?.read().replica;
        if let Some(replica) = replica {
            let known = self
                .storage
                .load_sync_states(&room.document_id)?
                .into_iter()
                .find(|(r, _)| *r == replica)
                .map(|(_, v)| v.join(&vector))
                .unwrap_or_else(|| vector.clone());
            self.storage.save_sync_state(&room.document_id, replica, &known)?;
        }

        let chunks = room
            .document
            .lock()
            .delta_chunks(&vector, self.config.sync_chunk_bytes)?;

        debug!(
            "Sending {} byte delta in {} frames to session {} for {}",
            chunks.iter().map(Vec::len).sum::<usize>(),
            chunks.len(),
            session_id,
            room.document_id
        );
        Ok(chunks
            .into_iter()
            .map(|delta| ServerMessage::SyncStep2 { delta })
            .collect())
    }

    /// Merge a client's `SyncStep2` and relay its operations to the other
    /// sessions if any were new.
    pub fn handle_sync_step2(&self, session_id: &str, delta: &[u8]) -> SyncResult<ApplyOutcome> {
        let room = self.joined_room(session_id)?;
        let delta = SyncDelta::decode(delta)
            .map_err(|e| DocumentError::MalformedRecord(e.to_string()))?;
        let outcome = room.document.lock().apply_sync(&delta);

        if outcome.changed() {
            let record = delta.record.encode().map_err(DocumentError::from)?;
            self.relay_update(&room, session_id, record);
        }
        Ok(outcome)
    }

    /// Merge a live update record from a session and relay it to the other
    /// sessions if it contained new operations.
    pub fn handle_update(&self, session_id: &str, delta: Vec<u8>) -> SyncResult<ApplyOutcome> {
        let room = self.joined_room(session_id)?;
        let outcome = room.document.lock().apply_update(&delta)?;

        if outcome.changed() {
            self.relay_update(&room, session_id, delta);
        } else {
            debug!("Update from {} carried nothing new", session_id);
        }

        Ok(outcome)
    }

    fn relay_update(&self, room: &DocumentRoom, session_id: &str, delta: Vec<u8>) {
        room.mark_dirty();
        if let Err(e) = self.storage.touch_document(&room.document_id) {
            warn!("Failed to touch metadata for {}: {}", room.document_id, e);
        }
        self.broadcast_to_document(
            &room.document_id,
            session_id,
            ServerMessage::Update {
                delta,
                from_session: Some(session_id.to_string()),
            },
        );
    }

    /// Apply a presence payload from a session and relay the accepted changes.
    ///
    /// A session may only speak for itself; records for other sessions are
    /// dropped. Returns the number of changes relayed.
    pub fn handle_awareness(&self, session_id: &str, payload: &[u8]) -> SyncResult<usize> {
        let room = self.joined_room(session_id)?;
        let updates = presence::decode_updates(payload)?;

        let mut relayed = Vec::new();
        for update in updates {
            if update.session_id != session_id {
                warn!(
                    "Session {} sent presence for {}; ignoring",
                    session_id, update.session_id
                );
                continue;
            }
            match update.record {
                Some(record) => relayed.push(room.presence.publish(session_id, record)),
                None => relayed.extend(room.presence.expire(session_id)),
            }
        }

        self.broadcast_presence(&room, session_id, &relayed);
        Ok(relayed.len())
    }

    /// Keepalive: refreshes session activity and presence liveness
    pub fn handle_ping(&self, session_id: &str, timestamp: u64) -> ServerMessage {
        if let Ok(room) = self.joined_room(session_id) {
            room.presence.refresh(session_id);
        }
        ServerMessage::Pong {
            timestamp,
            server_time: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Broadcast a message to all sessions in a document (except the sender)
    pub fn broadcast_to_document(&self, document_id: &str, exclude_session: &str, msg: ServerMessage) {
        let Some(room) = self.rooms.get(document_id).map(|r| r.clone()) else {
            return;
        };
        for sid in room.session_ids() {
            if sid == exclude_session {
                continue;
            }
            if let Some(session) = self.get_session(&sid) {
                if let Err(e) = session.read().send(msg.clone()) {
                    debug!("Dropping message for {}: {}", sid, e);
                }
            }
        }
    }

    fn broadcast_presence(&self, room: &DocumentRoom, exclude_session: &str, updates: &[PresenceUpdate]) {
        if updates.is_empty() {
            return;
        }
        match presence::encode_updates(updates) {
            Ok(payload) => self.broadcast_to_document(
                &room.document_id,
                exclude_session,
                ServerMessage::Awareness { payload },
            ),
            Err(e) => error!("Failed to encode presence for {}: {}", room.document_id, e),
        }
    }

    // =========================================================================
    // Document lifecycle
    // =========================================================================

    /// Create a document, optionally seeded with initial text
    pub fn create_document(&self, title: Option<String>, content: Option<&str>) -> SyncResult<DocumentMetadata> {
        let document_id = uuid::Uuid::new_v4().to_string();
        let metadata = DocumentMetadata::new(&document_id, normalize_title(title));

        if let Some(content) = content.filter(|c| !c.is_empty()) {
            let mut document = CollabDocument::new();
            document.insert_text(0, content);
            self.storage.save_updates(&document_id, &document.save()?)?;
        }
        self.storage.save_metadata(&metadata)?;

        info!("Created document: {} ({})", metadata.title, document_id);
        Ok(metadata)
    }

    pub fn rename_document(&self, document_id: &str, title: String) -> SyncResult<DocumentMetadata> {
        let title = normalize_title(Some(title));
        self.storage
            .update_metadata(document_id, |meta| {
                meta.title = title;
                meta.touch();
            })
            .map_err(|e| not_found_as(e, document_id))
    }

    /// Delete a document, closing it for any joined session
    pub fn delete_document(&self, document_id: &str) -> SyncResult<()> {
        if let Some((_, room)) = self.rooms.remove(document_id) {
            for sid in room.close() {
                if let Some(session) = self.get_session(&sid) {
                    let mut session = session.write();
                    session.joined = false;
                    let _ = session.send(SyncProtocol::error_response(
                        ErrorCode::DocumentNotFound,
                        "Document was deleted",
                    ));
                }
            }
        }

        if !self.storage.delete_document(document_id)? {
            return Err(SyncError::DocumentNotFound(document_id.to_string()));
        }
        info!("Deleted document {}", document_id);
        Ok(())
    }

    /// All documents, most recently modified first
    pub fn list_documents(&self) -> SyncResult<Vec<DocumentMetadata>> {
        Ok(self.storage.list_documents()?)
    }

    /// Metadata, materialized content and presence of one document
    pub fn document_snapshot(&self, document_id: &str) -> SyncResult<DocumentSnapshot> {
        let metadata = self
            .storage
            .get_metadata(document_id)?
            .ok_or_else(|| SyncError::DocumentNotFound(document_id.to_string()))?;

        let (text, blocks, presence) = match self.rooms.get(document_id).map(|r| r.clone()) {
            Some(room) => {
                let document = room.document.lock();
                (document.text(), document.blocks(), room.presence.list())
            }
            None => {
                let document = self.load_document(document_id)?;
                (document.text(), document.blocks(), Vec::new())
            }
        };

        Ok(DocumentSnapshot {
            metadata,
            text,
            blocks,
            presence,
        })
    }

    /// Load a document replica from storage, empty if nothing was saved yet.
    /// The server replica gets a fresh id on every load.
    fn load_document(&self, document_id: &str) -> SyncResult<CollabDocument> {
        match self.storage.load_updates(document_id)? {
            Some(data) => Ok(CollabDocument::load(ReplicaId::random(), &data)?),
            None => Ok(CollabDocument::new()),
        }
    }

    /// Get or create a document room
    async fn get_or_create_room(&self, document_id: &str) -> SyncResult<Arc<DocumentRoom>> {
        if let Some(room) = self.rooms.get(document_id) {
            return Ok(room.clone());
        }

        if self.storage.get_metadata(document_id)?.is_none() {
            info!("Creating document on first join: {}", document_id);
            self.storage
                .save_metadata(&DocumentMetadata::new(document_id, DEFAULT_TITLE))?;
        }

        let document = self.load_document(document_id)?;
        debug!("Loaded document {} ({} chars)", document_id, document.len());

        let room = self
            .rooms
            .entry(document_id.to_string())
            .or_insert_with(|| {
                Arc::new(DocumentRoom::new(
                    document_id,
                    document,
                    self.config.presence_timeout,
                ))
            })
            .clone();
        Ok(room)
    }

    fn record_session_count(&self, room: &DocumentRoom) {
        let count = room.session_count() as u32;
        if let Err(e) = self.storage.set_active_sessions(&room.document_id, count) {
            warn!("Failed to record session count for {}: {}", room.document_id, e);
        }
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    fn save_room(&self, room: &DocumentRoom) -> bool {
        let data = match room.document.lock().save() {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to serialize document {}: {}", room.document_id, e);
                return false;
            }
        };

        match self.storage.save_updates(&room.document_id, &data) {
            Ok(()) => {
                debug!("Saved document: {}", room.document_id);
                true
            }
            Err(e) => {
                error!("Failed to save document {}: {}", room.document_id, e);
                room.mark_dirty();
                false
            }
        }
    }

    /// Save dirty documents to storage
    pub async fn save_dirty_documents(&self) -> usize {
        let rooms: Vec<Arc<DocumentRoom>> = self.rooms.iter().map(|r| r.value().clone()).collect();
        rooms
            .iter()
            .filter(|room| room.take_dirty())
            .filter(|room| self.save_room(room))
            .count()
    }

    /// Expire presence, drop stale sessions, compact and evict idle rooms
    pub fn cleanup(&self) -> CleanupStats {
        self.cleanup_at(Instant::now())
    }

    fn cleanup_at(&self, now: Instant) -> CleanupStats {
        let mut stats = CleanupStats::default();
        let rooms: Vec<Arc<DocumentRoom>> = self.rooms.iter().map(|r| r.value().clone()).collect();

        for room in &rooms {
            let expired = room.presence.prune_expired(now);
            stats.expired_presence += expired.len();
            self.broadcast_presence(room, "", &expired);
        }

        let stale_sessions: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().read().is_stale(now, self.config.session_timeout))
            .map(|entry| entry.key().clone())
            .collect();
        for session_id in stale_sessions {
            warn!("Removing stale session: {}", session_id);
            self.unregister_session(&session_id);
            stats.stale_sessions += 1;
        }

        let timeout = self.config.session_timeout;
        self.tokens.retain(|_, r| {
            r.released_at
                .map_or(true, |at| now.saturating_duration_since(at) <= timeout)
        });

        if self.config.compaction_enabled {
            for room in &rooms {
                match self.compact_room(room) {
                    Ok(reclaimed) => stats.compacted_items += reclaimed,
                    Err(e) => warn!("Compaction failed for {}: {}", room.document_id, e),
                }
            }
        }

        let grace = self.config.room_grace_period;
        for room in &rooms {
            if !room.is_idle(now, grace) {
                continue;
            }
            if room.take_dirty() {
                self.save_room(room);
            }
            // Closing under the registry lock keeps a concurrent join from
            // landing in a room that is no longer registered.
            let evicted = self
                .rooms
                .remove_if(&room.document_id, |_, r| {
                    Arc::ptr_eq(r, room) && r.close_if_idle(now, grace)
                })
                .is_some();
            if evicted {
                info!("Evicted idle room: {}", room.document_id);
                stats.evicted_rooms += 1;
            }
        }

        stats
    }

    /// Reclaim tombstones in one room, bounded by the meet of every replica
    /// vector reported for the document. Skipped while a joined session has
    /// not reported one.
    fn compact_room(&self, room: &DocumentRoom) -> SyncResult<usize> {
        let states = self.storage.load_sync_states(&room.document_id)?;
        let reported: HashSet<ReplicaId> = states.iter().map(|(r, _)| *r).collect();

        for sid in room.session_ids() {
            let replica = self.get_session(&sid).and_then(|s| s.read().replica);
            if !replica.is_some_and(|r| reported.contains(&r)) {
                return Ok(0);
            }
        }

        let mut vectors = states.into_iter().map(|(_, v)| v);
        let Some(first) = vectors.next() else {
            return Ok(0);
        };
        let bound = vectors.fold(first, |acc, v| acc.meet(&v));

        let reclaimed = room.document.lock().compact(&bound);
        if reclaimed > 0 {
            room.mark_dirty();
            info!("Compacted {} tombstones in {}", reclaimed, room.document_id);
        }
        Ok(reclaimed)
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_documents: self.rooms.len(),
            active_sessions: self.sessions.len(),
            sessions_in_documents: self.rooms.iter().map(|r| r.session_count()).sum(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Get storage
    pub fn storage(&self) -> &Arc<DocumentStore> {
        &self.storage
    }

    /// Start background tasks (save loop, cleanup loop)
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let server = self.clone();
        let save_interval = server.config.save_interval;

        let save_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(save_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let saved = server.save_dirty_documents().await;
                        if saved > 0 {
                            debug!("Auto-saved {} documents", saved);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Save task shutting down");
                        server.save_dirty_documents().await;
                        if let Err(e) = server.storage.flush() {
                            error!("Final flush failed: {}", e);
                        }
                        break;
                    }
                }
            }
        });

        let server = self;
        let cleanup_interval = server.config.cleanup_interval;

        let cleanup_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let stats = server.cleanup();
                        if stats != CleanupStats::default() {
                            debug!("Cleanup: {:?}", stats);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Cleanup task shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            save_task: save_handle,
            cleanup_task: cleanup_handle,
        }
    }
}

fn not_found_as(err: StorageError, document_id: &str) -> SyncError {
    match err {
        StorageError::NotFound(_) => SyncError::DocumentNotFound(document_id.to_string()),
        other => other.into(),
    }
}

fn normalize_title(title: Option<String>) -> String {
    title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_TITLE.to_string())
}

fn display_name(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        "Anonymous".to_string()
    } else {
        name.chars().take(presence::MAX_NAME_LEN).collect()
    }
}

/// Generate a secure session token
pub fn generate_session_token() -> String {
    use sha2::{Digest, Sha256};
    let random_bytes: [u8; 32] = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(random_bytes);
    hasher.update(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Server statistics
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub active_documents: usize,
    pub active_sessions: usize,
    pub sessions_in_documents: usize,
    pub uptime_seconds: u64,
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub save_task: tokio::task::JoinHandle<()>,
    pub cleanup_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete
    pub async fn wait(self) {
        let _ = tokio::join!(self.save_task, self.cleanup_task);
    }
}
