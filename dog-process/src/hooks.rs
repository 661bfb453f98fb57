use std::sync::Arc;

use async_trait::async_trait;
use dog_upload::{DataStore, UploadId, UploadInfo};
use tracing::{debug, info, instrument, warn};

use crate::dispatcher::HookHandler;
use crate::pipeline::Pipeline;
use crate::record_store::RecordStore;
use crate::{ProcessResult, ProcessingRecord, ProcessingStatus};

/// Default hook handler: keeps processing records in step with uploads and
/// runs the post-processing pipeline on completion.
pub struct UploadHooks {
    records: Arc<dyn RecordStore>,
    uploads: Arc<dyn DataStore>,
    pipeline: Arc<Pipeline>,
}

impl UploadHooks {
    pub fn new(records: Arc<dyn RecordStore>, uploads: Arc<dyn DataStore>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            records,
            uploads,
            pipeline,
        }
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Copy the finished blob from the chunk store into permanent storage
    async fn store_blob(&self, record: &ProcessingRecord) -> ProcessResult<String> {
        let key = self.pipeline.keys().object_key(
            record.user_id.as_deref(),
            &record.upload_id,
            record.filename.as_deref(),
        );
        let reader = self.uploads.get_upload(&record.upload_id).await?.reader().await?;
        let bytes = self.pipeline.vault().put(&key, reader).await?;

        info!(upload_id = %record.upload_id, key = %key, bytes, "Upload moved to permanent storage");
        Ok(key)
    }

    /// Record `error` and move a processing record to failed
    async fn fail(&self, mut record: ProcessingRecord, error: String) -> ProcessResult<()> {
        let id = record.upload_id.clone();
        record.error = Some(error);
        self.records.update(record).await?;
        if !self
            .records
            .transition(&id, ProcessingStatus::Processing, ProcessingStatus::Failed)
            .await?
        {
            warn!(upload_id = %id, "Record left processing before it could be failed");
        }
        Ok(())
    }

    /// Drop the chunk-store copy once the blob lives in permanent storage
    async fn discard_upload(&self, id: &UploadId) {
        let result = match self.uploads.get_upload(id).await {
            Ok(upload) => match upload.as_terminatable() {
                Some(terminatable) => terminatable.terminate().await,
                None => Ok(()),
            },
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(upload_id = %id, error = %e, "Failed to remove processed upload from the chunk store");
        }
    }
}

#[async_trait]
impl HookHandler for UploadHooks {
    #[instrument(skip(self, info), fields(upload_id = %info.id))]
    async fn on_created(&self, info: UploadInfo) -> ProcessResult<()> {
        if info.is_partial {
            debug!("Partial upload, waiting for its final upload");
            return Ok(());
        }
        let record = ProcessingRecord::from_upload(&info);
        if self.records.create_if_absent(record).await? {
            info!("Processing record created");
        } else {
            debug!("Processing record already exists");
        }
        Ok(())
    }

    #[instrument(skip(self, info), fields(upload_id = %info.id))]
    async fn on_completed(&self, info: UploadInfo) -> ProcessResult<()> {
        // Partials stay in the chunk store until a final upload concatenates them
        if info.is_partial {
            debug!("Partial upload complete");
            return Ok(());
        }
        let record = self.records.get(&info.id).await?;
        if record.status != ProcessingStatus::Pending {
            debug!(status = %record.status, "Upload already processed");
            return Ok(());
        }
        if !self
            .records
            .transition(&info.id, ProcessingStatus::Pending, ProcessingStatus::Processing)
            .await?
        {
            debug!("Another worker claimed this upload");
            return Ok(());
        }

        let mut record = self.records.get(&info.id).await?;
        record.size = info.size.or(record.size);

        let key = match self.store_blob(&record).await {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "Moving upload to permanent storage failed");
                self.fail(record, format!("storage: {e}")).await?;
                return Err(e);
            }
        };
        record.storage_key = Some(key);
        // Persist the key before running instructions so it survives a crash mid-pipeline
        self.records.update(record.clone()).await?;

        let instructions = record.instructions.clone();
        let report = self.pipeline.run(&mut record, &instructions).await;
        let status = report.final_status(self.pipeline.config().strict);
        record.outcomes = report.outcomes.clone();
        if status == ProcessingStatus::Failed {
            record.error = report.error_summary();
        }

        if let Err(e) = self.records.update(record.clone()).await {
            warn!(error = %e, "Could not persist pipeline results");
            self.fail(record, format!("record store: {e}")).await?;
            return Err(e);
        }
        if !self
            .records
            .transition(&info.id, ProcessingStatus::Processing, status)
            .await?
        {
            warn!("Record status changed while the pipeline was running");
        }

        self.discard_upload(&info.id).await;
        info!(status = %status, instructions = instructions.len(), "Upload processed");
        Ok(())
    }

    #[instrument(skip(self, info), fields(upload_id = %info.id))]
    async fn on_terminated(&self, info: UploadInfo) -> ProcessResult<()> {
        match self.records.delete(&info.id).await {
            Ok(true) => info!("Processing record deleted"),
            Ok(false) => debug!("No processing record to delete"),
            Err(e) if e.is_not_found() => debug!("No processing record to delete"),
            Err(e) => return Err(e),
        }
        Ok(())
    }
}
