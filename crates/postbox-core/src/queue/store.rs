//! Record stores: where the queue writes its records through to.
//!
//! `FileRecordStore` keeps one JSON file per message in a spool directory:
//! - `msg-<ULID>.json` holds the serialized [`MessageRecord`]
//! - writes go to `.tmp_msg-<ULID>.json` first and are renamed into place,
//!   so a crash never leaves a half-written record behind
//! - leftover `.tmp_` files are removed when the store is opened

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};

use super::MessageRecord;
use crate::domain::MessageId;
use crate::error::QueueError;

const RECORD_SUFFIX: &str = ".json";
const TEMP_PREFIX: &str = ".tmp_";

/// Persistence behind the queue.
///
/// The queue calls these while holding its own lock, so implementations see
/// writes for a given message in order.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every stored record, oldest message first.
    async fn load(&self) -> Result<Vec<MessageRecord>, QueueError>;

    /// Insert or replace the record.
    async fn save(&self, record: &MessageRecord) -> Result<(), QueueError>;

    /// Forget the record. Removing an unknown id is not an error.
    async fn remove(&self, id: MessageId) -> Result<(), QueueError>;
}

#[derive(Debug, Clone)]
pub struct FileRecordStore {
    path: PathBuf,
}

fn unavailable(path: &Path, e: impl std::fmt::Display) -> QueueError {
    QueueError::Unavailable(format!("spool {}: {e}", path.display()))
}

impl FileRecordStore {
    /// Open the spool at `path`, creating the directory if needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        fs::create_dir_all(&path)
            .await
            .map_err(|e| unavailable(&path, e))?;

        let meta = fs::metadata(&path)
            .await
            .map_err(|e| unavailable(&path, e))?;
        if !meta.is_dir() {
            return Err(unavailable(&path, "not a directory"));
        }

        let store = Self { path };
        store.cleanup_temp_files().await?;
        info!(path = %store.path.display(), "spool opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_path(&self, id: MessageId) -> PathBuf {
        self.path.join(format!("{id}{RECORD_SUFFIX}"))
    }

    fn temp_path(&self, id: MessageId) -> PathBuf {
        self.path.join(format!("{TEMP_PREFIX}{id}{RECORD_SUFFIX}"))
    }

    async fn cleanup_temp_files(&self) -> Result<(), QueueError> {
        let mut entries = fs::read_dir(&self.path)
            .await
            .map_err(|e| unavailable(&self.path, e))?;
        let mut cleaned = 0;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unavailable(&self.path, e))?
        {
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                fs::remove_file(entry.path())
                    .await
                    .map_err(|e| unavailable(&self.path, e))?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            info!(cleaned, "removed partial writes from spool");
        }
        Ok(())
    }
}

/// Only `msg-<ULID>.json` names are records; anything else is left alone.
fn parse_record_name(name: &str) -> Option<MessageId> {
    if name.starts_with(TEMP_PREFIX) {
        return None;
    }
    name.strip_suffix(RECORD_SUFFIX)?.parse().ok()
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn load(&self) -> Result<Vec<MessageRecord>, QueueError> {
        let mut entries = fs::read_dir(&self.path)
            .await
            .map_err(|e| unavailable(&self.path, e))?;

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unavailable(&self.path, e))?
        {
            if let Some(id) = parse_record_name(&entry.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }
        // ULIDs sort by publish time
        ids.sort();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let path = self.record_path(id);
            let raw = fs::read(&path).await.map_err(|e| unavailable(&path, e))?;
            match serde_json::from_slice::<MessageRecord>(&raw) {
                Ok(record) if record.id == id => records.push(record),
                Ok(record) => {
                    warn!(file = %path.display(), message_id = %record.id, "record id does not match file name, skipping");
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "unreadable spool record, skipping");
                }
            }
        }

        debug!(count = records.len(), "spool loaded");
        Ok(records)
    }

    async fn save(&self, record: &MessageRecord) -> Result<(), QueueError> {
        let body = serde_json::to_vec(record).map_err(|e| unavailable(&self.path, e))?;
        let temp = self.temp_path(record.id);
        let target = self.record_path(record.id);

        fs::write(&temp, &body)
            .await
            .map_err(|e| unavailable(&temp, e))?;
        fs::rename(&temp, &target)
            .await
            .map_err(|e| unavailable(&target, e))?;
        Ok(())
    }

    async fn remove(&self, id: MessageId) -> Result<(), QueueError> {
        let path = self.record_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable(&path, e)),
        }
    }
}
