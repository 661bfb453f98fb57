use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;

use crate::UploadInfo;

/// Lifecycle notification emitted after an upload changed state
#[derive(Debug, Clone)]
pub struct UploadEvent {
    pub info: UploadInfo,
    pub at: DateTime<Utc>,
}

impl UploadEvent {
    pub fn new(info: UploadInfo) -> Self {
        Self { info, at: Utc::now() }
    }
}

/// Sending halves of the three lifecycle channels
#[derive(Debug, Clone)]
pub struct EventSenders {
    pub created: mpsc::Sender<UploadEvent>,
    pub completed: mpsc::Sender<UploadEvent>,
    pub terminated: mpsc::Sender<UploadEvent>,
}

/// Receiving halves, consumed by a hook dispatcher
#[derive(Debug)]
pub struct EventReceivers {
    pub created: mpsc::Receiver<UploadEvent>,
    pub completed: mpsc::Receiver<UploadEvent>,
    pub terminated: mpsc::Receiver<UploadEvent>,
}

/// Build bounded created/completed/terminated channels
pub fn event_channels(capacity: usize) -> (EventSenders, EventReceivers) {
    let capacity = capacity.max(1);
    let (created_tx, created_rx) = mpsc::channel(capacity);
    let (completed_tx, completed_rx) = mpsc::channel(capacity);
    let (terminated_tx, terminated_rx) = mpsc::channel(capacity);

    (
        EventSenders {
            created: created_tx,
            completed: completed_tx,
            terminated: terminated_tx,
        },
        EventReceivers {
            created: created_rx,
            completed: completed_rx,
            terminated: terminated_rx,
        },
    )
}

impl EventSenders {
    pub async fn created(&self, info: UploadInfo) {
        Self::emit(&self.created, "created", info).await
    }

    pub async fn completed(&self, info: UploadInfo) {
        Self::emit(&self.completed, "completed", info).await
    }

    pub async fn terminated(&self, info: UploadInfo) {
        Self::emit(&self.terminated, "terminated", info).await
    }

    /// A full channel waits for room; a closed one is logged and the event dropped
    async fn emit(tx: &mpsc::Sender<UploadEvent>, kind: &'static str, info: UploadInfo) {
        let upload_id = info.id.clone();
        if tx.send(UploadEvent::new(info)).await.is_err() {
            warn!(%upload_id, kind, "Upload event dropped: no hook dispatcher listening");
        }
    }
}
