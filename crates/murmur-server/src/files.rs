//! File transfer manager.
//!
//! Uploads arrive in chunks over HTTP and are keyed by a server-generated
//! random UUID. Each upload walks a fixed state machine:
//!
//! | from        | event  | to          |
//! |-------------|--------|-------------|
//! | (none)      | start  | Receiving   |
//! | Receiving   | chunk  | Receiving   |
//! | Receiving   | finish | Finalized   |
//! | Finalized   | share  | (FileRecord)|
//!
//! Any other event is rejected. Once shared, the blob is tracked by a
//! [`FileRecord`] whose reference list decides its lifetime: when the
//! list becomes empty the record is dropped and the blob is deleted.
//!
//! Identical content uploaded twice gets two identifiers; there is no
//! content-hash dedup and no integrity check on the server.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use murmur_shared::constants::PARTIAL_UPLOAD_SUFFIX;
use murmur_shared::protocol::{Recipient, ServerMessage};

use crate::error::ServerError;
use crate::hub::Hub;
use crate::registry::{FileRecord, FileReference, RegistryState};

// ---------------------------------------------------------------------------
// Upload state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Receiving { bytes: u64 },
    Finalized { bytes: u64 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("Unknown upload")]
    Unknown,

    #[error("Upload already finalized")]
    AlreadyFinalized,

    #[error("Upload not finalized")]
    NotFinalized,
}

/// An upload that has been started but not yet shared.
#[derive(Debug, Clone)]
pub struct UploadSlot {
    pub state: UploadState,
    /// Refreshed by start, every chunk and finish.
    pub last_activity: DateTime<Utc>,
    pub filename: Option<String>,
}

impl UploadSlot {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: UploadState::Receiving { bytes: 0 },
            last_activity: now,
            filename: None,
        }
    }

    pub fn ensure_receiving(&self) -> Result<(), UploadError> {
        match self.state {
            UploadState::Receiving { .. } => Ok(()),
            UploadState::Finalized { .. } => Err(UploadError::AlreadyFinalized),
        }
    }

    pub fn record_chunk(&mut self, len: u64, now: DateTime<Utc>) -> Result<u64, UploadError> {
        match &mut self.state {
            UploadState::Receiving { bytes } => {
                *bytes += len;
                self.last_activity = now;
                Ok(*bytes)
            }
            UploadState::Finalized { .. } => Err(UploadError::AlreadyFinalized),
        }
    }

    pub fn finalize(
        &mut self,
        filename: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<u64, UploadError> {
        match self.state {
            UploadState::Receiving { bytes } => {
                self.state = UploadState::Finalized { bytes };
                self.filename = filename;
                self.last_activity = now;
                Ok(bytes)
            }
            UploadState::Finalized { .. } => Err(UploadError::AlreadyFinalized),
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.state, UploadState::Finalized { .. })
    }
}

// ---------------------------------------------------------------------------
// Disk
// ---------------------------------------------------------------------------

/// Upload directory layout: `<uuid>.part` while receiving, `<uuid>` once
/// finalized.
#[derive(Debug, Clone)]
pub struct FileStore {
    upload_dir: PathBuf,
}

impl FileStore {
    pub async fn new(upload_dir: PathBuf) -> Result<Self, ServerError> {
        fs::create_dir_all(&upload_dir).await.map_err(|e| {
            ServerError::Storage(format!(
                "Failed to create upload directory '{}': {}",
                upload_dir.display(),
                e
            ))
        })?;

        info!(path = %upload_dir.display(), "File store initialized");

        Ok(Self { upload_dir })
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn partial_path(&self, uuid: &Uuid) -> PathBuf {
        self.upload_dir
            .join(format!("{}.{}", uuid, PARTIAL_UPLOAD_SUFFIX))
    }

    pub fn blob_path(&self, uuid: &Uuid) -> PathBuf {
        self.upload_dir.join(uuid.to_string())
    }

    async fn create_sink(&self, uuid: &Uuid) -> std::io::Result<()> {
        fs::File::create(self.partial_path(uuid)).await?;
        Ok(())
    }

    /// Append to an existing sink; never creates one.
    async fn append(&self, uuid: &Uuid, data: &[u8]) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(self.partial_path(uuid))
            .await?;
        file.write_all(data).await?;
        file.flush().await
    }

    async fn finalize(&self, uuid: &Uuid) -> std::io::Result<()> {
        fs::rename(self.partial_path(uuid), self.blob_path(uuid)).await
    }

    /// Best-effort delete; failures are logged, never returned.
    async fn remove(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "Deleted file"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete file"),
        }
    }

    async fn discard_upload(&self, uuid: &Uuid) {
        self.remove(&self.partial_path(uuid)).await;
        self.remove(&self.blob_path(uuid)).await;
    }

    pub async fn remove_records(&self, records: &[FileRecord]) {
        for record in records {
            info!(
                uuid = %record.uuid,
                file = %record.original_filename,
                "No references left, deleting file"
            );
            self.remove(&record.path).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Registry-side operations
// ---------------------------------------------------------------------------

/// Record that `sender` shared `uuid` with `recipient`.
///
/// The first share of a finalized upload promotes it to a [`FileRecord`];
/// later shares only append a reference. Returns the reference count.
pub fn add_reference(
    state: &mut RegistryState,
    store: &FileStore,
    uuid: Uuid,
    sender: &str,
    recipient: Recipient,
) -> Result<usize, UploadError> {
    if state.lookup_file(&uuid).is_none() {
        match state.upload(&uuid) {
            Some(slot) if slot.is_finalized() => {}
            Some(_) => return Err(UploadError::NotFinalized),
            None => return Err(UploadError::Unknown),
        }
        let filename = state
            .remove_upload(&uuid)
            .and_then(|slot| slot.filename)
            .unwrap_or_else(|| uuid.to_string());
        state.insert_file(FileRecord {
            uuid,
            original_filename: filename,
            path: store.blob_path(&uuid),
            references: Vec::new(),
        });
        info!(uuid = %uuid, sender = %sender, recipient = %recipient, "Registered new file");
    }

    let reference = FileReference {
        sender: sender.to_string(),
        recipient,
    };
    let count = state
        .upsert_file_reference(&uuid, reference)
        .ok_or(UploadError::Unknown)?;
    debug!(uuid = %uuid, sender = %sender, references = count, "Added file reference");
    Ok(count)
}

/// Reference pruning for a departing connection.
///
/// Direct references naming `nickname` go immediately. Group references
/// survive until nobody at all is connected.
pub fn collect_garbage(state: &mut RegistryState, nickname: Option<&str>) -> Vec<FileRecord> {
    let mut collected = Vec::new();
    if let Some(nickname) = nickname {
        collected.extend(
            state.drop_file_references(|r| !r.recipient.is_group() && r.involves(nickname)),
        );
    }
    if state.connection_count() == 0 {
        let group = state.drop_file_references(|r| r.recipient.is_group());
        if !group.is_empty() {
            info!(files = group.len(), "Room is empty, releasing group files");
        }
        collected.extend(group);
    }
    collected
}

fn upload_error(uuid: Uuid, e: UploadError) -> ServerError {
    match e {
        UploadError::Unknown | UploadError::AlreadyFinalized => ServerError::UploadNotFound(uuid),
        UploadError::NotFinalized => ServerError::BadRequest(e.to_string()),
    }
}

/// An opened blob ready to stream, with the record's display name.
#[derive(Debug)]
pub struct Download {
    pub filename: String,
    pub file: fs::File,
    pub size: u64,
}

impl Hub {
    pub async fn start_upload(&self) -> Result<Uuid, ServerError> {
        let uuid = Uuid::new_v4();
        self.store().create_sink(&uuid).await.map_err(|e| {
            ServerError::Storage(format!("Failed to create upload sink {}: {}", uuid, e))
        })?;
        self.registry()
            .lock()
            .await
            .insert_upload(uuid, UploadSlot::new(Utc::now()));

        debug!(uuid = %uuid, "Upload started");
        Ok(uuid)
    }

    pub async fn append_chunk(&self, uuid: Uuid, data: &[u8]) -> Result<u64, ServerError> {
        {
            let state = self.registry().lock().await;
            let slot = state.upload(&uuid).ok_or(ServerError::UploadNotFound(uuid))?;
            slot.ensure_receiving().map_err(|e| upload_error(uuid, e))?;
        }

        self.store().append(&uuid, data).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ServerError::UploadNotFound(uuid)
            } else {
                ServerError::Storage(format!("Failed to append to upload {}: {}", uuid, e))
            }
        })?;

        let mut state = self.registry().lock().await;
        let slot = state
            .upload_mut(&uuid)
            .ok_or(ServerError::UploadNotFound(uuid))?;
        let total = slot
            .record_chunk(data.len() as u64, Utc::now())
            .map_err(|e| upload_error(uuid, e))?;
        debug!(uuid = %uuid, chunk = data.len(), total, "Chunk received");
        Ok(total)
    }

    pub async fn finish_upload(&self, uuid: Uuid, filename: Option<String>) -> Result<(), ServerError> {
        {
            let state = self.registry().lock().await;
            let slot = state.upload(&uuid).ok_or(ServerError::UploadNotFound(uuid))?;
            slot.ensure_receiving().map_err(|e| upload_error(uuid, e))?;
        }

        self.store().finalize(&uuid).await.map_err(|e| {
            warn!(uuid = %uuid, error = %e, "Failed to finalize upload");
            ServerError::Storage(format!("Failed to finalize upload {}: {}", uuid, e))
        })?;

        let mut state = self.registry().lock().await;
        let slot = state
            .upload_mut(&uuid)
            .ok_or(ServerError::UploadNotFound(uuid))?;
        let bytes = slot
            .finalize(filename.filter(|f| !f.is_empty()), Utc::now())
            .map_err(|e| upload_error(uuid, e))?;
        info!(uuid = %uuid, bytes, "Upload finished");
        Ok(())
    }

    /// Serve a blob, but only while a record (and so a reference) exists.
    pub async fn download(&self, uuid: Uuid) -> Result<Download, ServerError> {
        let (filename, path) = {
            let state = self.registry().lock().await;
            let record = state
                .lookup_file(&uuid)
                .ok_or_else(|| ServerError::FileNotFound(uuid.to_string()))?;
            (record.original_filename.clone(), record.path.clone())
        };

        let read_error = |e: std::io::Error| {
            if e.kind() == ErrorKind::NotFound {
                ServerError::FileNotFound(uuid.to_string())
            } else {
                ServerError::Storage(format!("Failed to read file {}: {}", uuid, e))
            }
        };
        let file = fs::File::open(&path).await.map_err(read_error)?;
        let size = file.metadata().await.map_err(read_error)?.len();

        debug!(uuid = %uuid, size, "Serving download");
        Ok(Download {
            filename,
            file,
            size,
        })
    }

    /// Instant share of an already stored file.
    ///
    /// Returns `false`, with no side effects, if `uuid` is not stored.
    pub async fn share_existing(&self, uuid: Uuid, from: &str, to: Recipient) -> bool {
        let (notice, targets) = {
            let mut state = self.registry().lock().await;
            let Some(record) = state.lookup_file(&uuid) else {
                return false;
            };
            let original_filename = record.original_filename.clone();
            if add_reference(&mut state, self.store(), uuid, from, to.clone()).is_err() {
                return false;
            }
            let targets = match &to {
                Recipient::Group => {
                    let sender = state.resolve_nickname(from).map(|c| c.id());
                    state.peers(sender)
                }
                Recipient::User(nickname) => state.resolve_nickname(nickname).into_iter().collect(),
            };
            let notice = ServerMessage::FileNotification {
                from: from.to_string(),
                uuid: uuid.to_string(),
                original_filename,
            };
            (notice, targets)
        };

        info!(uuid = %uuid, from = %from, to = %to, "Instant share of stored file");
        let overflowed = self.fan_out(&targets, &notice);
        self.evict(overflowed).await;
        true
    }

    /// Drop unshared uploads that have seen no start, chunk or finish for
    /// longer than the session timeout.
    pub async fn sweep_abandoned_uploads(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.settings().session_timeout;
        let abandoned: Vec<Uuid> = {
            let mut state = self.registry().lock().await;
            state
                .uploads_idle_since(cutoff)
                .into_iter()
                .filter(|uuid| state.remove_upload(uuid).is_some())
                .collect()
        };

        for uuid in &abandoned {
            info!(uuid = %uuid, "Discarding abandoned upload");
            self.store().discard_upload(uuid).await;
        }
        abandoned.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::testing::{test_hub, Peer};

    async fn uploaded(hub: &Hub, data: &[u8]) -> Uuid {
        let uuid = hub.start_upload().await.unwrap();
        hub.append_chunk(uuid, data).await.unwrap();
        hub.finish_upload(uuid, Some("notes.txt".into())).await.unwrap();
        uuid
    }

    #[test]
    fn test_upload_transitions() {
        let mut slot = UploadSlot::new(Utc::now());
        let now = Utc::now();
        assert_eq!(slot.record_chunk(3, now), Ok(3));
        assert_eq!(slot.record_chunk(2, now), Ok(5));
        assert_eq!(slot.finalize(None, now), Ok(5));
        assert!(slot.is_finalized());
        assert_eq!(slot.record_chunk(1, now), Err(UploadError::AlreadyFinalized));
        assert_eq!(slot.finalize(None, now), Err(UploadError::AlreadyFinalized));
    }

    #[tokio::test]
    async fn test_chunks_are_concatenated() {
        let (hub, _dir) = test_hub().await;
        let uuid = hub.start_upload().await.unwrap();
        assert!(hub.store().partial_path(&uuid).exists());

        hub.append_chunk(uuid, b"hello ").await.unwrap();
        assert_eq!(hub.append_chunk(uuid, b"world").await.unwrap(), 11);
        hub.finish_upload(uuid, None).await.unwrap();

        assert!(!hub.store().partial_path(&uuid).exists());
        let stored = std::fs::read(hub.store().blob_path(&uuid)).unwrap();
        assert_eq!(stored, b"hello world");
    }

    #[tokio::test]
    async fn test_chunk_requires_started_upload() {
        let (hub, _dir) = test_hub().await;
        let err = hub.append_chunk(Uuid::new_v4(), b"x").await.unwrap_err();
        assert!(matches!(err, ServerError::UploadNotFound(_)));

        let uuid = uploaded(&hub, b"done").await;
        let err = hub.append_chunk(uuid, b"more").await.unwrap_err();
        assert!(matches!(err, ServerError::UploadNotFound(_)));
        let err = hub.finish_upload(uuid, None).await.unwrap_err();
        assert!(matches!(err, ServerError::UploadNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_sink_fails_finish() {
        let (hub, _dir) = test_hub().await;
        let uuid = hub.start_upload().await.unwrap();
        std::fs::remove_file(hub.store().partial_path(&uuid)).unwrap();

        let err = hub.finish_upload(uuid, None).await.unwrap_err();
        assert!(matches!(err, ServerError::Storage(_)));
    }

    #[tokio::test]
    async fn test_download_requires_record() {
        let (hub, _dir) = test_hub().await;
        let uuid = uploaded(&hub, b"secret").await;

        // Finalized but never shared.
        assert!(matches!(
            hub.download(uuid).await,
            Err(ServerError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_add_reference_dedups_record() {
        let (hub, _dir) = test_hub().await;
        let uuid = uploaded(&hub, b"abc").await;

        let mut state = hub.registry().lock().await;
        let first = add_reference(&mut state, hub.store(), uuid, "alice", Recipient::Group);
        let second = add_reference(
            &mut state,
            hub.store(),
            uuid,
            "alice",
            Recipient::User("bob".into()),
        );
        assert_eq!(first, Ok(1));
        assert_eq!(second, Ok(2));
        assert_eq!(state.file_count(), 1);
        assert_eq!(state.lookup_file(&uuid).unwrap().original_filename, "notes.txt");
        assert!(state.upload(&uuid).is_none());
    }

    #[tokio::test]
    async fn test_reference_to_unfinished_upload_is_refused() {
        let (hub, _dir) = test_hub().await;
        let uuid = hub.start_upload().await.unwrap();
        let mut state = hub.registry().lock().await;
        assert_eq!(
            add_reference(&mut state, hub.store(), uuid, "alice", Recipient::Group),
            Err(UploadError::NotFinalized)
        );
        assert_eq!(
            add_reference(&mut state, hub.store(), Uuid::new_v4(), "alice", Recipient::Group),
            Err(UploadError::Unknown)
        );
    }

    #[tokio::test]
    async fn test_group_file_outlives_sender_until_room_empties() {
        let (hub, _dir) = test_hub().await;
        let alice = Peer::registered(&hub, "c-a", "alice").await;
        let bob = Peer::registered(&hub, "c-b", "bob").await;
        let carol = Peer::registered(&hub, "c-c", "carol").await;

        let uuid = uploaded(&hub, b"group file").await;
        alice
            .say(&hub, &format!(r#"{{"type":"fileShare","to":"group","uuid":"{uuid}","data":"m"}}"#))
            .await;
        let path = hub.store().blob_path(&uuid);

        hub.disconnect(alice.id()).await;
        assert!(path.exists());
        assert!(hub.download(uuid).await.is_ok());

        hub.disconnect(bob.id()).await;
        assert!(path.exists());

        hub.disconnect(carol.id()).await;
        assert!(!path.exists());
        assert!(matches!(
            hub.download(uuid).await,
            Err(ServerError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_private_file_collected_when_party_leaves() {
        let (hub, _dir) = test_hub().await;
        let alice = Peer::registered(&hub, "c-a", "alice").await;
        let bob = Peer::registered(&hub, "c-b", "bob").await;
        let _carol = Peer::registered(&hub, "c-c", "carol").await;

        let uuid = uploaded(&hub, b"for bob").await;
        alice
            .say(&hub, &format!(r#"{{"type":"fileShare","to":"bob","uuid":"{uuid}","data":"m"}}"#))
            .await;
        assert!(hub.download(uuid).await.is_ok());

        hub.disconnect(bob.id()).await;
        assert!(!hub.store().blob_path(&uuid).exists());
        assert_eq!(hub.registry().lock().await.file_count(), 0);
    }

    #[tokio::test]
    async fn test_share_existing_notifies_and_adds_reference() {
        let (hub, _dir) = test_hub().await;
        let mut alice = Peer::registered(&hub, "c-a", "alice").await;
        let mut bob = Peer::registered(&hub, "c-b", "bob").await;

        assert!(!hub.share_existing(Uuid::new_v4(), "alice", Recipient::Group).await);

        let uuid = uploaded(&hub, b"again").await;
        alice
            .say(&hub, &format!(r#"{{"type":"fileShare","to":"group","uuid":"{uuid}","data":"m"}}"#))
            .await;
        alice.drain();
        bob.drain();

        assert!(hub.share_existing(uuid, "alice", Recipient::Group).await);
        let notices = bob.drain();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0]["type"], "fileNotification");
        assert_eq!(notices[0]["originalFilename"], "notes.txt");
        assert!(alice.drain().is_empty());

        let state = hub.registry().lock().await;
        assert_eq!(state.lookup_file(&uuid).unwrap().references.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_spares_upload_with_recent_chunk() {
        let (hub, _dir) = test_hub().await;
        let timeout = hub.settings().session_timeout;
        let slow = hub.start_upload().await.unwrap();
        let stale = hub.start_upload().await.unwrap();
        {
            let mut state = hub.registry().lock().await;
            let long_ago = Utc::now() - timeout - chrono::Duration::seconds(10);
            state.upload_mut(&slow).unwrap().last_activity = long_ago;
            state.upload_mut(&stale).unwrap().last_activity = long_ago;
        }

        // Started long ago, but still streaming.
        hub.append_chunk(slow, b"abc").await.unwrap();

        assert_eq!(hub.sweep_abandoned_uploads(Utc::now()).await, 1);
        assert!(hub.store().partial_path(&slow).exists());
        assert!(!hub.store().partial_path(&stale).exists());
        assert_eq!(hub.append_chunk(slow, b"def").await.unwrap(), 6);
        hub.finish_upload(slow, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_download_streams_whole_blob() {
        let (hub, _dir) = test_hub().await;
        let _alice = Peer::registered(&hub, "c-a", "alice").await;
        let uuid = uploaded(&hub, b"streamed bytes").await;
        {
            let mut state = hub.registry().lock().await;
            add_reference(&mut state, hub.store(), uuid, "alice", Recipient::Group).unwrap();
        }

        let mut download = hub.download(uuid).await.unwrap();
        assert_eq!(download.filename, "notes.txt");
        assert_eq!(download.size, 14);
        let mut data = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut download.file, &mut data)
            .await
            .unwrap();
        assert_eq!(data, b"streamed bytes");
    }

    #[tokio::test]
    async fn test_sweep_abandoned_uploads() {
        let (hub, _dir) = test_hub().await;
        let pending = hub.start_upload().await.unwrap();
        let finished = uploaded(&hub, b"never shared").await;

        assert_eq!(hub.sweep_abandoned_uploads(Utc::now()).await, 0);

        let later = Utc::now() + hub.settings().session_timeout + chrono::Duration::seconds(1);
        assert_eq!(hub.sweep_abandoned_uploads(later).await, 2);
        assert!(!hub.store().partial_path(&pending).exists());
        assert!(!hub.store().blob_path(&finished).exists());
        assert!(matches!(
            hub.append_chunk(pending, b"x").await,
            Err(ServerError::UploadNotFound(_))
        ));
    }
}
