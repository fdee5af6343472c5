//! Persistent queue of reports captured while offline.
//!
//! The whole queue lives under one storage key as a JSON array. Every mutation
//! is a read-modify-write of that array, serialized by an in-process lock.

use crate::capabilities::{KeyNamespace, KeyValueStore, KvError, KvKey};
use crate::model::{QueueEntryId, QueuedReport, Report, UserId};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

pub const DEFAULT_QUEUE_KEY: &str = "pending-reports";
pub const DEFAULT_MAX_ENTRIES: usize = 500;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("report queue is full ({0} entries)")]
    Full(usize),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    #[error("corrupted queue data: {0}")]
    Corrupted(String),
}

impl QueueError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Storage(e) if e.is_retryable())
    }
}

/// Entries written before queue ids existed are bare reports.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Current(QueuedReport),
    Legacy(Report),
}

pub struct ReportQueue<S> {
    store: Arc<S>,
    key: KvKey,
    max_entries: usize,
    lock: Mutex<()>,
}

impl<S: KeyValueStore> ReportQueue<S> {
    pub fn new(store: Arc<S>, key: &str, max_entries: usize) -> Result<Self, QueueError> {
        Ok(Self {
            store,
            key: KvKey::new(KeyNamespace::Outbox, key)?,
            max_entries,
            lock: Mutex::new(()),
        })
    }

    pub fn with_defaults(store: Arc<S>) -> Result<Self, QueueError> {
        Self::new(store, DEFAULT_QUEUE_KEY, DEFAULT_MAX_ENTRIES)
    }

    pub fn storage_key(&self) -> &KvKey {
        &self.key
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Appends a snapshot of `report`. The stored copy is never modified afterwards.
    #[instrument(skip(self, report), fields(key = %self.key.raw()))]
    pub async fn enqueue(
        &self,
        report: Report,
        submitted_by: Option<UserId>,
    ) -> Result<QueuedReport, QueueError> {
        let _guard = self.lock.lock().await;

        let mut entries = self.load().await?;
        if entries.len() >= self.max_entries {
            warn!(len = entries.len(), "report queue full, rejecting enqueue");
            return Err(QueueError::Full(entries.len()));
        }

        let entry = QueuedReport::new(report, submitted_by);
        entries.push(entry.clone());
        self.save(&entries).await?;

        info!(id = %entry.id, len = entries.len(), "report queued");
        Ok(entry)
    }

    /// Returns every queued entry in insertion order without removing any.
    #[instrument(skip(self), fields(key = %self.key.raw()))]
    pub async fn drain_all(&self) -> Result<Vec<QueuedReport>, QueueError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    #[instrument(skip(self), fields(key = %self.key.raw()))]
    pub async fn clear(&self) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        let existed = self.store.delete(&self.key).await.map_err(|e| {
            error!(error = %e, "failed to clear report queue");
            QueueError::from(e)
        })?;
        debug!(existed, "report queue cleared");
        Ok(())
    }

    pub async fn remove(&self, id: &QueueEntryId) -> Result<bool, QueueError> {
        Ok(self.remove_many(std::slice::from_ref(id)).await? > 0)
    }

    /// Removes the given entries, keeping everything else in order.
    #[instrument(skip(self, ids), fields(key = %self.key.raw(), count = ids.len()))]
    pub async fn remove_many(&self, ids: &[QueueEntryId]) -> Result<usize, QueueError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let _guard = self.lock.lock().await;

        let entries = self.load().await?;
        let targets: HashSet<&QueueEntryId> = ids.iter().collect();
        let before = entries.len();
        let kept: Vec<QueuedReport> = entries
            .into_iter()
            .filter(|entry| !targets.contains(&entry.id))
            .collect();
        let removed = before - kept.len();

        if removed == 0 {
            return Ok(0);
        }

        if kept.is_empty() {
            self.store.delete(&self.key).await.map_err(|e| {
                error!(error = %e, "failed to delete emptied report queue");
                QueueError::from(e)
            })?;
        } else {
            self.save(&kept).await?;
        }

        debug!(removed, remaining = kept.len(), "queued reports removed");
        Ok(removed)
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.drain_all().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Caller must hold `self.lock`.
    async fn load(&self) -> Result<Vec<QueuedReport>, QueueError> {
        let bytes = match self.store.get(&self.key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => {
                error!(error = %e, "failed to read report queue");
                return Err(e.into());
            }
        };

        let stored: Vec<StoredEntry> = serde_json::from_slice(&bytes).map_err(|e| {
            error!(error = %e, "report queue is not a valid JSON array");
            QueueError::Corrupted(e.to_string())
        })?;

        let mut migrated = 0usize;
        let entries: Vec<QueuedReport> = stored
            .into_iter()
            .map(|entry| match entry {
                StoredEntry::Current(queued) => queued,
                StoredEntry::Legacy(report) => {
                    migrated += 1;
                    QueuedReport::new(report, None)
                }
            })
            .collect();

        if migrated > 0 {
            warn!(migrated, "migrating legacy queue entries");
            self.save(&entries).await?;
        }

        Ok(entries)
    }

    /// Caller must hold `self.lock`.
    async fn save(&self, entries: &[QueuedReport]) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(entries).map_err(|e| {
            QueueError::Storage(KvError::Serialization {
                message: e.to_string(),
                key: Some(self.key.raw()),
            })
        })?;

        self.store.set(&self.key, bytes).await.map_err(|e| {
            error!(error = %e, "failed to write report queue");
            QueueError::from(e)
        })
    }
}
