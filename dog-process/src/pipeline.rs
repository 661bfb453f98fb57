use std::sync::Arc;

use async_trait::async_trait;
use dog_upload::UploadReader;
use tokio::io::AsyncReadExt;
use tracing::{info, instrument, warn};

use crate::instruction::{Instruction, InstructionOutcome};
use crate::transcription::{AudioSource, Transcriber};
use crate::vault::{DefaultKeyStrategy, KeyStrategy, PermanentStore};
use crate::{PipelineConfig, ProcessError, ProcessResult, ProcessingRecord, ProcessingStatus};

/// Image operation requested from an [`ImageTransform`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOp {
    /// Exact output size
    Resize { width: u32, height: u32 },
    /// Fit inside the box, keeping the aspect ratio
    Thumbnail { max_width: u32, max_height: u32 },
}

/// Image codec capability; encoding and decoding live outside this crate
#[async_trait]
pub trait ImageTransform: Send + Sync {
    async fn apply(&self, source: UploadReader, op: ImageOp) -> ProcessResult<UploadReader>;
}

/// Per-instruction results of one pipeline run, in execution order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub outcomes: Vec<InstructionOutcome>,
}

impl PipelineReport {
    pub fn failures(&self) -> impl Iterator<Item = &InstructionOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    /// Transcription failures always fail the record; other failures only when `strict`
    pub fn final_status(&self, strict: bool) -> ProcessingStatus {
        let fatal = self.failures().any(|o| {
            strict || Instruction::parse(o.instruction()) == Some(Instruction::TranscribeAudio)
        });
        if fatal {
            ProcessingStatus::Failed
        } else {
            ProcessingStatus::Completed
        }
    }

    /// `instruction: error` pairs joined for the record's error field
    pub fn error_summary(&self) -> Option<String> {
        let errors: Vec<String> = self
            .failures()
            .map(|o| format!("{}: {}", o.instruction(), o.error().unwrap_or_default()))
            .collect();
        if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        }
    }
}

enum Step {
    Done,
    Skip(String),
}

/// Runs requested instructions against a blob already in permanent storage
pub struct Pipeline {
    vault: Arc<dyn PermanentStore>,
    keys: Arc<dyn KeyStrategy>,
    transcriber: Option<Arc<dyn Transcriber>>,
    images: Option<Arc<dyn ImageTransform>>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(vault: Arc<dyn PermanentStore>, config: PipelineConfig) -> Self {
        Self {
            vault,
            keys: Arc::new(DefaultKeyStrategy),
            transcriber: None,
            images: None,
            config,
        }
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn with_image_transform(mut self, images: Arc<dyn ImageTransform>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn with_key_strategy(mut self, keys: Arc<dyn KeyStrategy>) -> Self {
        self.keys = keys;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn vault(&self) -> &Arc<dyn PermanentStore> {
        &self.vault
    }

    pub fn keys(&self) -> &Arc<dyn KeyStrategy> {
        &self.keys
    }

    /// Execute `instructions` strictly in order. A failing instruction is
    /// recorded and the remaining ones still run.
    #[instrument(skip(self, record, instructions), fields(upload_id = %record.upload_id, count = instructions.len()))]
    pub async fn run(&self, record: &mut ProcessingRecord, instructions: &[String]) -> PipelineReport {
        let mut report = PipelineReport::default();

        for raw in instructions {
            let outcome = match Instruction::parse(raw) {
                None => {
                    warn!(upload_id = %record.upload_id, instruction = %raw, "Ignoring unknown processing instruction");
                    InstructionOutcome::skipped(raw.as_str(), "unknown instruction")
                }
                Some(instruction) => match self.execute(record, instruction).await {
                    Ok(Step::Done) => {
                        info!(upload_id = %record.upload_id, %instruction, "Instruction succeeded");
                        InstructionOutcome::succeeded(raw.as_str())
                    }
                    Ok(Step::Skip(reason)) => {
                        info!(upload_id = %record.upload_id, %instruction, %reason, "Instruction skipped");
                        InstructionOutcome::skipped(raw.as_str(), reason)
                    }
                    Err(e) => {
                        warn!(upload_id = %record.upload_id, %instruction, error = %e, "Instruction failed");
                        InstructionOutcome::failed(raw.as_str(), e)
                    }
                },
            };
            report.outcomes.push(outcome);
        }

        report
    }

    async fn execute(&self, record: &mut ProcessingRecord, instruction: Instruction) -> ProcessResult<Step> {
        let key = record
            .storage_key
            .clone()
            .ok_or_else(|| ProcessError::instruction("upload has not been moved to permanent storage"))?;

        match instruction {
            Instruction::Resize { width, height } => {
                let kind = format!("resize-{}x{}", width, height);
                self.derive_image(record, &key, &kind, ImageOp::Resize { width, height })
                    .await
            }
            Instruction::Thumbnail => {
                let (max_width, max_height) = self.config.thumbnail_size;
                self.derive_image(
                    record,
                    &key,
                    "thumbnail",
                    ImageOp::Thumbnail {
                        max_width,
                        max_height,
                    },
                )
                .await
            }
            Instruction::ExtractText => self.extract_text(record, &key).await,
            Instruction::TranscribeAudio => self.transcribe(record, &key).await,
        }
    }

    async fn derive_image(
        &self,
        record: &mut ProcessingRecord,
        key: &str,
        kind: &str,
        op: ImageOp,
    ) -> ProcessResult<Step> {
        let Some(images) = &self.images else {
            return Ok(Step::Skip("no image transform configured".to_string()));
        };
        if !has_prefix(record.content_type.as_deref(), &["image/"]) {
            return Ok(Step::Skip("not an image".to_string()));
        }

        let source = self.vault.open(key).await?;
        let output = images.apply(source, op).await?;
        let derived = self.keys.derived_key(key, kind);
        self.vault.put(&derived, output).await?;

        record.derived.push(derived);
        Ok(Step::Done)
    }

    async fn extract_text(&self, record: &mut ProcessingRecord, key: &str) -> ProcessResult<Step> {
        let textual = has_prefix(record.content_type.as_deref(), &["text/"])
            || matches!(
                record.content_type.as_deref().map(base_mime),
                Some("application/json") | Some("application/xml")
            );
        if !textual {
            return Ok(Step::Skip("not a text document".to_string()));
        }

        let reader = self.vault.open(key).await?;
        let mut buf = Vec::new();
        reader
            .take(self.config.extract_text_limit as u64)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| ProcessError::io("read stored document", e))?;

        record.extracted_text = Some(String::from_utf8_lossy(&buf).into_owned());
        Ok(Step::Done)
    }

    async fn transcribe(&self, record: &mut ProcessingRecord, key: &str) -> ProcessResult<Step> {
        let Some(transcriber) = &self.transcriber else {
            return Ok(Step::Skip("no transcriber configured".to_string()));
        };
        if record.content_type.is_some()
            && !has_prefix(record.content_type.as_deref(), &["audio/", "video/"])
        {
            return Ok(Step::Skip("not an audio or video file".to_string()));
        }

        let reader = self.vault.open(key).await?;
        let filename = record
            .filename
            .clone()
            .unwrap_or_else(|| record.upload_id.to_string());
        let mut audio = AudioSource::new(reader, filename);
        if let Some(content_type) = &record.content_type {
            audio = audio.with_content_type(content_type.clone());
        }

        record.transcription = Some(transcriber.transcribe(audio).await?);
        Ok(Step::Done)
    }
}

/// `text/plain; charset=utf-8` → `text/plain`
fn base_mime(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or_default().trim()
}

fn has_prefix(content_type: Option<&str>, prefixes: &[&str]) -> bool {
    content_type
        .map(|ct| base_mime(ct).to_ascii_lowercase())
        .is_some_and(|ct| prefixes.iter().any(|p| ct.starts_with(p)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::LocalPermanentStore;
    use dog_upload::{MetaData, UploadId, UploadInfo};
    use std::io::Cursor;
    use tracing_test::traced_test;

    struct Reverse;

    #[async_trait]
    impl ImageTransform for Reverse {
        async fn apply(&self, mut source: UploadReader, _op: ImageOp) -> ProcessResult<UploadReader> {
            let mut bytes = Vec::new();
            source
                .read_to_end(&mut bytes)
                .await
                .map_err(|e| ProcessError::io("read image", e))?;
            bytes.reverse();
            Ok(Box::pin(Cursor::new(bytes)))
        }
    }

    async fn stored_record(vault: &LocalPermanentStore, content_type: &str, body: &[u8]) -> ProcessingRecord {
        let mut metadata = MetaData::new();
        metadata.insert("filetype".into(), content_type.into());
        let info = UploadInfo::new(UploadId::from("u1"), Some(body.len() as u64), metadata);
        let mut record = ProcessingRecord::from_upload(&info);

        vault
            .put("anonymous/2024/01/u1", Box::pin(Cursor::new(body.to_vec())))
            .await
            .unwrap();
        record.storage_key = Some("anonymous/2024/01/u1".into());
        record
    }

    fn instructions(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_instructions_are_skipped_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(LocalPermanentStore::new(dir.path()));
        let pipeline = Pipeline::new(vault.clone(), PipelineConfig::default());
        let mut record = stored_record(&vault, "text/plain", b"plain words").await;

        let report = pipeline
            .run(&mut record, &instructions(&["sharpen", "extract_text"]))
            .await;

        assert_eq!(
            report.outcomes,
            vec![
                InstructionOutcome::skipped("sharpen", "unknown instruction"),
                InstructionOutcome::succeeded("extract_text"),
            ]
        );
        assert_eq!(record.extracted_text.as_deref(), Some("plain words"));
        assert!(logs_contain("Ignoring unknown processing instruction"));
    }

    #[tokio::test]
    async fn extract_text_respects_limit_and_type() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(LocalPermanentStore::new(dir.path()));
        let pipeline = Pipeline::new(
            vault.clone(),
            PipelineConfig::default().with_extract_text_limit(4),
        );

        let mut record = stored_record(&vault, "application/json; charset=utf-8", b"{\"a\":1}").await;
        pipeline.run(&mut record, &instructions(&["extract_text"])).await;
        assert_eq!(record.extracted_text.as_deref(), Some("{\"a\""));

        let mut record = stored_record(&vault, "audio/mpeg", b"ID3").await;
        let report = pipeline.run(&mut record, &instructions(&["extract_text"])).await;
        assert!(matches!(report.outcomes[0], InstructionOutcome::Skipped { .. }));
        assert!(record.extracted_text.is_none());
    }

    #[tokio::test]
    async fn image_instructions_store_derived_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(LocalPermanentStore::new(dir.path()));
        let pipeline = Pipeline::new(vault.clone(), PipelineConfig::default())
            .with_image_transform(Arc::new(Reverse));
        let mut record = stored_record(&vault, "image/png", b"png!").await;

        let report = pipeline
            .run(&mut record, &instructions(&["thumbnail", "resize:64x32"]))
            .await;

        assert!(!report.has_failures());
        assert_eq!(
            record.derived,
            vec![
                "anonymous/2024/01/u1.thumbnail".to_string(),
                "anonymous/2024/01/u1.resize-64x32".to_string(),
            ]
        );
        let mut out = Vec::new();
        vault
            .open("anonymous/2024/01/u1.thumbnail")
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, b"!gnp");
    }

    #[tokio::test]
    async fn failures_do_not_abort_later_instructions() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Arc::new(LocalPermanentStore::new(dir.path()));
        let pipeline = Pipeline::new(vault.clone(), PipelineConfig::default());
        let mut record = stored_record(&vault, "text/plain", b"abc").await;
        record.storage_key = Some("anonymous/2024/01/missing".into());

        let report = pipeline
            .run(&mut record, &instructions(&["extract_text", "thumbnail"]))
            .await;

        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcomes[0].is_failed());
        assert!(matches!(report.outcomes[1], InstructionOutcome::Skipped { .. }));
        assert_eq!(report.final_status(false), ProcessingStatus::Completed);
    }

    #[test]
    fn transcription_failure_is_fatal() {
        let report = PipelineReport {
            outcomes: vec![
                InstructionOutcome::succeeded("thumbnail"),
                InstructionOutcome::failed("transcribe_audio", "upstream 500"),
            ],
        };
        assert_eq!(report.final_status(false), ProcessingStatus::Failed);
        assert_eq!(
            report.error_summary().as_deref(),
            Some("transcribe_audio: upstream 500")
        );
    }

    #[test]
    fn other_failures_only_fatal_when_strict() {
        let report = PipelineReport {
            outcomes: vec![
                InstructionOutcome::failed("extract_text", "disk"),
                InstructionOutcome::skipped("sharpen", "unknown instruction"),
            ],
        };
        assert_eq!(report.final_status(false), ProcessingStatus::Completed);
        assert_eq!(report.final_status(true), ProcessingStatus::Failed);
        assert!(PipelineReport::default().error_summary().is_none());
    }

    #[test]
    fn mime_matching_ignores_parameters_and_case() {
        assert!(has_prefix(Some("Text/Plain; charset=utf-8"), &["text/"]));
        assert!(!has_prefix(None, &["text/"]));
        assert_eq!(base_mime("application/json; charset=utf-8"), "application/json");
    }
}
