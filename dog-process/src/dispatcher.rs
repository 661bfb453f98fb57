use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dog_upload::{EventReceivers, UploadId, UploadInfo};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{DispatcherConfig, ProcessError, ProcessResult};

/// Upload lifecycle event as seen by hook handlers
#[derive(Debug, Clone)]
pub enum HookEvent {
    Created(UploadInfo),
    Completed(UploadInfo),
    Terminated(UploadInfo),
}

impl HookEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Completed(_) => "completed",
            Self::Terminated(_) => "terminated",
        }
    }

    pub fn info(&self) -> &UploadInfo {
        match self {
            Self::Created(info) | Self::Completed(info) | Self::Terminated(info) => info,
        }
    }

    pub fn upload_id(&self) -> &UploadId {
        &self.info().id
    }
}

/// Reacts to upload lifecycle events. Delivery is at-least-once, so every
/// method must tolerate being called twice for the same upload.
#[async_trait]
pub trait HookHandler: Send + Sync + 'static {
    async fn on_created(&self, info: UploadInfo) -> ProcessResult<()>;

    async fn on_completed(&self, info: UploadInfo) -> ProcessResult<()>;

    async fn on_terminated(&self, info: UploadInfo) -> ProcessResult<()>;
}

/// Snapshot of dispatcher activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Events taken off the upload channels
    pub routed: u64,
    /// Handler calls that returned `Ok`
    pub handled: u64,
    /// Handler calls that returned an error or panicked
    pub failed: u64,
    pub panicked: u64,
    /// Events waiting in each worker's queue
    pub queue_depths: Vec<usize>,
}

struct Shared {
    routed: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    depths: Vec<AtomicUsize>,
}

/// Routes upload lifecycle events to a fixed pool of hook workers.
///
/// A single router task drains the created, completed and terminated
/// channels, preferring them in that order, and forwards each event to the
/// worker owning its upload id. Each worker has a bounded queue, so a slow
/// handler backs up the router instead of growing memory.
pub struct HookDispatcher;

impl HookDispatcher {
    pub fn start(
        receivers: EventReceivers,
        handler: Arc<dyn HookHandler>,
        config: DispatcherConfig,
    ) -> DispatcherHandle {
        let worker_count = config.workers.max(1);
        let shared = Arc::new(Shared {
            routed: AtomicU64::new(0),
            handled: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            depths: (0..worker_count).map(|_| AtomicUsize::new(0)).collect(),
        });

        let mut queues = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            queues.push(tx);
            workers.push(tokio::spawn(work(index, rx, handler.clone(), shared.clone())));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let router = tokio::spawn(route(receivers, queues, shutdown_rx, shared.clone()));

        info!(workers = worker_count, queue_capacity = config.queue_capacity, "Hook dispatcher started");

        DispatcherHandle {
            shutdown_tx: Some(shutdown_tx),
            router,
            workers,
            shared,
        }
    }
}

/// Worker index for an upload id; stable for the lifetime of the process
pub fn shard_for(id: &UploadId, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

async fn route(
    mut receivers: EventReceivers,
    queues: Vec<mpsc::Sender<HookEvent>>,
    mut shutdown_rx: oneshot::Receiver<()>,
    shared: Arc<Shared>,
) {
    // created, completed, terminated
    let mut open = [true; 3];
    loop {
        if !open.iter().any(|o| *o) {
            debug!("All upload event channels closed");
            break;
        }

        let event = tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                info!("Hook dispatcher shutdown requested");
                break;
            }
            event = receivers.created.recv(), if open[0] => match event {
                Some(event) => HookEvent::Created(event.info),
                None => {
                    open[0] = false;
                    continue;
                }
            },
            event = receivers.completed.recv(), if open[1] => match event {
                Some(event) => HookEvent::Completed(event.info),
                None => {
                    open[1] = false;
                    continue;
                }
            },
            event = receivers.terminated.recv(), if open[2] => match event {
                Some(event) => HookEvent::Terminated(event.info),
                None => {
                    open[2] = false;
                    continue;
                }
            },
        };

        let shard = shard_for(event.upload_id(), queues.len());
        shared.routed.fetch_add(1, Ordering::Relaxed);
        shared.depths[shard].fetch_add(1, Ordering::Relaxed);

        // Blocks while the worker's queue is full
        if let Err(mpsc::error::SendError(event)) = queues[shard].send(event).await {
            shared.depths[shard].fetch_sub(1, Ordering::Relaxed);
            error!(
                upload_id = %event.upload_id(),
                event = event.event_name(),
                worker = shard,
                "Hook worker is gone; event dropped"
            );
        }
    }
    // Dropping the queues lets workers finish what they already hold
}

async fn work(
    index: usize,
    mut queue: mpsc::Receiver<HookEvent>,
    handler: Arc<dyn HookHandler>,
    shared: Arc<Shared>,
) {
    while let Some(event) = queue.recv().await {
        shared.depths[index].fetch_sub(1, Ordering::Relaxed);

        let name = event.event_name();
        let upload_id = event.upload_id().clone();
        let call = async {
            match event {
                HookEvent::Created(info) => handler.on_created(info).await,
                HookEvent::Completed(info) => handler.on_completed(info).await,
                HookEvent::Terminated(info) => handler.on_terminated(info).await,
            }
        };

        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => {
                shared.handled.fetch_add(1, Ordering::Relaxed);
                debug!(%upload_id, event = name, worker = index, "Hook handled");
            }
            Ok(Err(e)) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                error!(%upload_id, event = name, worker = index, error = %e, "Hook failed");
            }
            Err(panic) => {
                shared.failed.fetch_add(1, Ordering::Relaxed);
                shared.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    %upload_id,
                    event = name,
                    worker = index,
                    panic = %panic_message(panic.as_ref()),
                    "Hook panicked"
                );
            }
        }
    }
    debug!(worker = index, "Hook worker stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle for managing the dispatcher's lifecycle
pub struct DispatcherHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    router: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl DispatcherHandle {
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            routed: self.shared.routed.load(Ordering::Relaxed),
            handled: self.shared.handled.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
            queue_depths: self
                .shared
                .depths
                .iter()
                .map(|d| d.load(Ordering::Relaxed))
                .collect(),
        }
    }

    /// Stop routing new events, then wait for workers to finish queued ones
    pub async fn shutdown(mut self) -> ProcessResult<DispatcherStats> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.wait().await
    }

    /// Wait until every upload event sender is gone and all events are handled
    pub async fn join(self) -> ProcessResult<DispatcherStats> {
        self.wait().await
    }

    async fn wait(mut self) -> ProcessResult<DispatcherStats> {
        (&mut self.router)
            .await
            .map_err(|e| ProcessError::Internal(format!("Hook router join error: {}", e)))?;

        for worker in std::mem::take(&mut self.workers) {
            if let Err(e) = worker.await {
                warn!(error = %e, "Hook worker join error");
            }
        }

        let stats = self.stats();
        info!(
            routed = stats.routed,
            handled = stats.handled,
            failed = stats.failed,
            "Hook dispatcher stopped"
        );
        Ok(stats)
    }
}
