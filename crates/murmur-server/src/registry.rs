//! In-memory relay state.
//!
//! Connections, the nickname index, durable sessions, stored files and
//! in-flight uploads all live in one [`RegistryState`] behind a single
//! lock. Callers take the lock once per logical operation, compose the
//! primitives below, copy out whatever they need for network I/O, and
//! release it before sending anything.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use murmur_shared::protocol::{Directory, Recipient};

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::files::UploadSlot;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A registered socket and the identity currently bound to it.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub handle: Arc<ConnectionHandle>,
    /// `None` until the client registers.
    pub nickname: Option<String>,
    pub public_key: String,
    /// Client identifier of the owning session, if any.
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Disconnected,
}

/// Durable identity that survives reconnects.
#[derive(Debug, Clone)]
pub struct Session {
    pub client_id: String,
    pub nickname: String,
    pub public_key: String,
    pub live: Option<ConnectionId>,
    pub last_seen: DateTime<Utc>,
}

impl Session {
    pub fn state(&self) -> SessionState {
        if self.live.is_some() {
            SessionState::Active
        } else {
            SessionState::Disconnected
        }
    }
}

/// Why a stored file is kept: somebody shared it with somebody.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    pub sender: String,
    pub recipient: Recipient,
}

impl FileReference {
    pub fn involves(&self, nickname: &str) -> bool {
        self.sender == nickname || matches!(&self.recipient, Recipient::User(n) if n == nickname)
    }
}

/// One stored blob and the references keeping it alive.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub uuid: Uuid,
    pub original_filename: String,
    pub path: PathBuf,
    pub references: Vec<FileReference>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    nicknames: HashMap<String, ConnectionId>,
    sessions: HashMap<String, Session>,
    files: HashMap<Uuid, FileRecord>,
    uploads: HashMap<Uuid, UploadSlot>,
}

impl RegistryState {
    // -- connections --

    pub fn add_connection(&mut self, handle: Arc<ConnectionHandle>) {
        self.connections.insert(
            handle.id(),
            ConnectionEntry {
                handle,
                nickname: None,
                public_key: String::new(),
                session_id: None,
            },
        );
    }

    /// Remove a connection and release its nickname binding.
    ///
    /// Returns `None` if the connection was already gone, so teardown
    /// work keyed on the result runs at most once.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(&id)?;
        if let Some(nickname) = &entry.nickname {
            if self.nicknames.get(nickname) == Some(&id) {
                self.nicknames.remove(nickname);
            }
        }
        Some(entry)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionEntry> {
        self.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionEntry> {
        self.connections.get_mut(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn nickname_of(&self, id: ConnectionId) -> Option<String> {
        self.connections.get(&id).and_then(|e| e.nickname.clone())
    }

    // -- nickname index --

    /// Bind `nickname` to a registered connection.
    ///
    /// Fails if the nickname already resolves to another connection or if
    /// the connection is unknown. Any previous nickname of the connection
    /// is released.
    pub fn bind_nickname(&mut self, nickname: &str, id: ConnectionId) -> bool {
        if matches!(self.nicknames.get(nickname), Some(owner) if *owner != id) {
            return false;
        }
        let Some(entry) = self.connections.get_mut(&id) else {
            return false;
        };
        if let Some(previous) = entry.nickname.replace(nickname.to_string()) {
            if previous != nickname {
                self.nicknames.remove(&previous);
            }
        }
        self.nicknames.insert(nickname.to_string(), id);
        true
    }

    pub fn resolve_nickname(&self, nickname: &str) -> Option<Arc<ConnectionHandle>> {
        let id = self.nicknames.get(nickname)?;
        self.connections.get(id).map(|e| e.handle.clone())
    }

    pub fn is_bound(&self, nickname: &str) -> bool {
        self.nicknames.contains_key(nickname)
    }

    /// Bound to a live connection, or reserved by a disconnected session.
    pub fn nickname_in_use(&self, nickname: &str) -> bool {
        self.is_bound(nickname)
            || self
                .sessions
                .values()
                .any(|s| s.live.is_none() && s.nickname == nickname)
    }

    // -- sessions --

    pub fn lookup_session(&self, client_id: &str) -> Option<&Session> {
        self.sessions.get(client_id)
    }

    pub fn session_mut(&mut self, client_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(client_id)
    }

    pub fn upsert_session(&mut self, session: Session) {
        self.sessions.insert(session.client_id.clone(), session);
    }

    pub fn expire_session(&mut self, client_id: &str) -> Option<Session> {
        self.sessions.remove(client_id)
    }

    /// Client identifiers of disconnected sessions last seen before `cutoff`.
    pub fn sessions_idle_since(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.live.is_none() && s.last_seen < cutoff)
            .map(|s| s.client_id.clone())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // -- files --

    pub fn lookup_file(&self, uuid: &Uuid) -> Option<&FileRecord> {
        self.files.get(uuid)
    }

    pub fn insert_file(&mut self, record: FileRecord) {
        self.files.insert(record.uuid, record);
    }

    /// Append a reference to an existing record; returns the new count.
    pub fn upsert_file_reference(&mut self, uuid: &Uuid, reference: FileReference) -> Option<usize> {
        let record = self.files.get_mut(uuid)?;
        record.references.push(reference);
        Some(record.references.len())
    }

    /// Drop every reference matching `predicate`, then remove and return
    /// the records left without references.
    pub fn drop_file_references<F>(&mut self, mut predicate: F) -> Vec<FileRecord>
    where
        F: FnMut(&FileReference) -> bool,
    {
        let mut emptied = Vec::new();
        for (uuid, record) in self.files.iter_mut() {
            let before = record.references.len();
            record.references.retain(|r| !predicate(r));
            if before > 0 && record.references.is_empty() {
                emptied.push(*uuid);
            }
        }
        emptied
            .into_iter()
            .filter_map(|uuid| self.files.remove(&uuid))
            .collect()
    }

    /// Rewrite references after a nickname change.
    pub fn rename_references(&mut self, old: &str, new: &str) {
        for reference in self.files.values_mut().flat_map(|r| r.references.iter_mut()) {
            if reference.sender == old {
                reference.sender = new.to_string();
            }
            if matches!(&reference.recipient, Recipient::User(n) if n == old) {
                reference.recipient = Recipient::User(new.to_string());
            }
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    // -- uploads --

    pub fn insert_upload(&mut self, uuid: Uuid, slot: UploadSlot) {
        self.uploads.insert(uuid, slot);
    }

    pub fn upload(&self, uuid: &Uuid) -> Option<&UploadSlot> {
        self.uploads.get(uuid)
    }

    pub fn upload_mut(&mut self, uuid: &Uuid) -> Option<&mut UploadSlot> {
        self.uploads.get_mut(uuid)
    }

    pub fn remove_upload(&mut self, uuid: &Uuid) -> Option<UploadSlot> {
        self.uploads.remove(uuid)
    }

    pub fn uploads_idle_since(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        self.uploads
            .iter()
            .filter(|(_, slot)| slot.last_activity < cutoff)
            .map(|(uuid, _)| *uuid)
            .collect()
    }

    // -- snapshots --

    /// Handles of every registered connection except `exclude`.
    pub fn peers(&self, exclude: Option<ConnectionId>) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .values()
            .filter(|e| e.nickname.is_some() && Some(e.handle.id()) != exclude)
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Nickname -> public key for every registered connection.
    pub fn directory(&self) -> Directory {
        self.nicknames
            .iter()
            .filter_map(|(nickname, id)| {
                self.connections
                    .get(id)
                    .map(|e| (nickname.clone(), e.public_key.clone()))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Owner of the relay state. The only way in is [`Registry::lock`].
#[derive(Debug, Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().await
    }
}
