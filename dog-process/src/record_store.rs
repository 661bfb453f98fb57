use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dog_upload::UploadId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{ProcessError, ProcessResult, ProcessingRecord, ProcessingStatus};

/// Change notifications emitted by a record store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordEvent {
    Created {
        upload_id: UploadId,
        at: DateTime<Utc>,
    },

    StatusChanged {
        upload_id: UploadId,
        from: ProcessingStatus,
        to: ProcessingStatus,
        at: DateTime<Utc>,
    },

    Updated {
        upload_id: UploadId,
        at: DateTime<Utc>,
    },

    Deleted {
        upload_id: UploadId,
        at: DateTime<Utc>,
    },
}

impl RecordEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::StatusChanged { .. } => "status_changed",
            Self::Updated { .. } => "updated",
            Self::Deleted { .. } => "deleted",
        }
    }

    pub fn upload_id(&self) -> &UploadId {
        match self {
            Self::Created { upload_id, .. } => upload_id,
            Self::StatusChanged { upload_id, .. } => upload_id,
            Self::Updated { upload_id, .. } => upload_id,
            Self::Deleted { upload_id, .. } => upload_id,
        }
    }
}

/// Persistence for processing records.
///
/// Status only moves through [`RecordStore::transition`], a compare-and-set,
/// which is what makes duplicate lifecycle events harmless.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert the record unless one already exists for its upload id.
    /// Returns `true` when the record was inserted.
    async fn create_if_absent(&self, record: ProcessingRecord) -> ProcessResult<bool>;

    async fn find(&self, id: &UploadId) -> ProcessResult<Option<ProcessingRecord>>;

    async fn get(&self, id: &UploadId) -> ProcessResult<ProcessingRecord> {
        self.find(id)
            .await?
            .ok_or_else(|| ProcessError::record_not_found(id.as_str()))
    }

    /// Move `from` → `to` if the stored status is still `from`.
    /// Returns `false` when another writer got there first.
    async fn transition(
        &self,
        id: &UploadId,
        from: ProcessingStatus,
        to: ProcessingStatus,
    ) -> ProcessResult<bool>;

    /// Replace every field except `status`
    async fn update(&self, record: ProcessingRecord) -> ProcessResult<()>;

    /// Returns whether a record was removed
    async fn delete(&self, id: &UploadId) -> ProcessResult<bool>;

    fn subscribe(&self) -> broadcast::Receiver<RecordEvent>;
}

/// In-memory record store for tests and single-node deployments
#[derive(Clone)]
pub struct MemoryRecordStore {
    records: Arc<RwLock<HashMap<UploadId, ProcessingRecord>>>,
    event_broadcaster: broadcast::Sender<RecordEvent>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        let (event_broadcaster, _) = broadcast::channel(1000);

        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            event_broadcaster,
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn emit(&self, event: RecordEvent) {
        // No subscribers is fine
        let _ = self.event_broadcaster.send(event);
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_if_absent(&self, record: ProcessingRecord) -> ProcessResult<bool> {
        let upload_id = record.upload_id.clone();
        {
            let mut records = self.records.write();
            if records.contains_key(&upload_id) {
                return Ok(false);
            }
            records.insert(upload_id.clone(), record);
        }

        self.emit(RecordEvent::Created {
            upload_id,
            at: Utc::now(),
        });
        Ok(true)
    }

    async fn find(&self, id: &UploadId) -> ProcessResult<Option<ProcessingRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn transition(
        &self,
        id: &UploadId,
        from: ProcessingStatus,
        to: ProcessingStatus,
    ) -> ProcessResult<bool> {
        if !from.can_transition_to(to) {
            return Err(ProcessError::Store(format!(
                "illegal status transition {} -> {}",
                from, to
            )));
        }

        let now = Utc::now();
        {
            let mut records = self.records.write();
            let record = records
                .get_mut(id)
                .ok_or_else(|| ProcessError::record_not_found(id.as_str()))?;

            if record.status != from {
                return Ok(false);
            }

            record.status = to;
            record.updated_at = now;
            if to.is_terminal() {
                record.completed_at = Some(now);
            }
        }

        self.emit(RecordEvent::StatusChanged {
            upload_id: id.clone(),
            from,
            to,
            at: now,
        });
        Ok(true)
    }

    async fn update(&self, mut record: ProcessingRecord) -> ProcessResult<()> {
        let upload_id = record.upload_id.clone();
        {
            let mut records = self.records.write();
            let existing = records
                .get_mut(&upload_id)
                .ok_or_else(|| ProcessError::record_not_found(upload_id.as_str()))?;

            record.status = existing.status;
            record.completed_at = existing.completed_at;
            record.touch();
            *existing = record;
        }

        self.emit(RecordEvent::Updated {
            upload_id,
            at: Utc::now(),
        });
        Ok(())
    }

    async fn delete(&self, id: &UploadId) -> ProcessResult<bool> {
        let removed = self.records.write().remove(id).is_some();
        if removed {
            self.emit(RecordEvent::Deleted {
                upload_id: id.clone(),
                at: Utc::now(),
            });
        }
        Ok(removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.event_broadcaster.subscribe()
    }
}
