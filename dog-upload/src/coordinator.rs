use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::{
    DataStore, EventSenders, NewUpload, ProtocolError, Upload, UploadBody, UploadConfig,
    UploadError, UploadId, UploadInfo, UploadReader, UploadResult,
};

/// Drives a [`DataStore`] the way the upload protocol handler does and emits
/// lifecycle events. Completion is only emitted after the final chunk write
/// has returned, so a dispatcher always sees created before completed for an id.
pub struct UploadCoordinator {
    store: Arc<dyn DataStore>,
    events: Option<EventSenders>,
    config: UploadConfig,
}

impl UploadCoordinator {
    pub fn new<S: DataStore + 'static>(store: S, config: UploadConfig) -> Self {
        Self::from_arc(Arc::new(store), config)
    }

    pub fn from_arc(store: Arc<dyn DataStore>, config: UploadConfig) -> Self {
        Self {
            store,
            events: None,
            config,
        }
    }

    /// Emit created/completed/terminated events on these channels
    pub fn with_events(mut self, events: EventSenders) -> Self {
        self.events = Some(events);
        self
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Create an upload. A final upload is concatenated from its partials right away.
    #[instrument(skip(self, upload), fields(is_final = upload.is_final))]
    pub async fn create(&self, upload: NewUpload) -> UploadResult<UploadInfo> {
        if let (Some(size), Some(max)) = (upload.size, self.config.max_upload_bytes) {
            if size > max {
                return Err(ProtocolError::MaxSizeExceeded { length: size, max }.into());
            }
        }

        if upload.is_final {
            return self.create_final(upload).await;
        }

        let handle = self.store.new_upload(upload).await?;
        let mut info = handle.info().await?;
        self.emit_created(&info).await;

        if info.is_complete() {
            // Zero-length uploads are finished on creation
            info = handle.finish().await?;
            self.emit_completed(&info).await;
        }

        info!(upload_id = %info.id, size = ?info.size, "Upload created");
        Ok(info)
    }

    async fn create_final(&self, upload: NewUpload) -> UploadResult<UploadInfo> {
        if !self.store.capabilities().concatenate {
            return Err(UploadError::unsupported("concatenation"));
        }

        let partials = upload.partial_uploads.clone();
        let handle = self.store.new_upload(upload).await?;
        let concat = handle
            .as_concatable()
            .ok_or_else(|| UploadError::unsupported("concatenation"))?;

        let info = match concat.concatenate(&partials).await {
            Ok(info) => info,
            Err(e) => {
                // The final upload never became complete; drop it rather than leave a stub
                if let Some(terminate) = handle.as_terminatable() {
                    terminate.terminate().await?;
                }
                return Err(e);
            }
        };

        self.emit_created(&info).await;
        let info = handle.finish().await?;
        self.emit_completed(&info).await;
        self.release_partials(&partials).await;

        info!(upload_id = %info.id, parts = partials.len(), "Final upload assembled");
        Ok(info)
    }

    /// Delete partials once their bytes live in a final upload. Failures only leave garbage behind.
    async fn release_partials(&self, partials: &[UploadId]) {
        for id in partials {
            let result = match self.store.get_upload(id).await {
                Ok(handle) => match handle.as_terminatable() {
                    Some(terminatable) => terminatable.terminate().await,
                    None => Ok(()),
                },
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(upload_id = %id, error = %e, "Failed to release partial upload");
            }
        }
    }

    /// Write a chunk at `offset`; emits completed when the last byte lands
    #[instrument(skip(self, body))]
    pub async fn patch(&self, id: &UploadId, offset: u64, body: UploadBody) -> UploadResult<UploadInfo> {
        let handle = self.store.get_upload(id).await?;
        handle.write_chunk(offset, body).await?;
        self.finish_if_complete(handle.as_ref()).await
    }

    /// Current offset/length, as answered to a resumption check
    pub async fn head(&self, id: &UploadId) -> UploadResult<UploadInfo> {
        self.store.get_upload(id).await?.info().await
    }

    /// Declare the length of an upload created with a deferred length
    #[instrument(skip(self))]
    pub async fn declare_length(&self, id: &UploadId, length: u64) -> UploadResult<UploadInfo> {
        let handle = self.store.get_upload(id).await?;
        handle
            .as_length_declarable()
            .ok_or_else(|| UploadError::unsupported("creation-defer-length"))?
            .declare_length(length)
            .await?;
        self.finish_if_complete(handle.as_ref()).await
    }

    /// Delete an upload. Unknown ids are a no-op.
    #[instrument(skip(self))]
    pub async fn terminate(&self, id: &UploadId) -> UploadResult<()> {
        let handle = match self.store.get_upload(id).await {
            Ok(handle) => handle,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let info = handle.info().await?;

        handle
            .as_terminatable()
            .ok_or_else(|| UploadError::unsupported("termination"))?
            .terminate()
            .await?;

        if let Some(events) = &self.events {
            events.terminated(info).await;
        }
        info!(upload_id = %id, "Upload terminated");
        Ok(())
    }

    /// Reader over the stored bytes
    pub async fn open(&self, id: &UploadId) -> UploadResult<UploadReader> {
        self.store.get_upload(id).await?.reader().await
    }

    async fn finish_if_complete(&self, handle: &dyn Upload) -> UploadResult<UploadInfo> {
        let info = handle.info().await?;
        if !info.is_complete() {
            return Ok(info);
        }

        let info = handle.finish().await?;
        self.emit_completed(&info).await;
        Ok(info)
    }

    async fn emit_created(&self, info: &UploadInfo) {
        if let Some(events) = &self.events {
            events.created(info.clone()).await;
        }
    }

    async fn emit_completed(&self, info: &UploadInfo) {
        if let Some(events) = &self.events {
            events.completed(info.clone()).await;
        }
    }
}
