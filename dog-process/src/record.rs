use chrono::{DateTime, Utc};
use dog_upload::{UploadId, UploadInfo};
use serde::{Deserialize, Serialize};

use crate::instruction::{parse_instructions, InstructionOutcome};

/// Processing record lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Upload created, waiting for the last byte
    Pending,

    /// Blob moved to permanent storage, instructions running
    Processing,

    /// Pipeline finished
    Completed,

    /// Move or pipeline failed; `error` on the record says why
    Failed,
}

impl ProcessingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Allowed edges: pending → processing → {completed, failed}, and pending → failed
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Failed)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One row per upload tracking its post-completion processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub upload_id: UploadId,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub category: Option<String>,
    pub visibility: Option<String>,
    pub user_id: Option<String>,
    pub size: Option<u64>,

    /// Full upload metadata, serialized for later inspection
    pub metadata_json: String,

    /// Requested instructions, in execution order
    pub instructions: Vec<String>,

    pub status: ProcessingStatus,

    /// Permanent storage key once the blob has been moved
    pub storage_key: Option<String>,

    pub transcription: Option<TranscriptionResult>,
    pub extracted_text: Option<String>,

    /// Keys of derived artifacts (thumbnails, resized images)
    #[serde(default)]
    pub derived: Vec<String>,

    #[serde(default)]
    pub outcomes: Vec<InstructionOutcome>,

    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessingRecord {
    /// Pending record built from the upload's creation-time metadata
    pub fn from_upload(info: &UploadInfo) -> Self {
        let meta = |key: &str| info.metadata.get(key).filter(|v| !v.is_empty()).cloned();
        let now = Utc::now();

        Self {
            upload_id: info.id.clone(),
            filename: info.filename().map(str::to_string),
            content_type: info.content_type().map(str::to_string),
            category: meta("category"),
            visibility: meta("visibility"),
            user_id: meta("user_id"),
            size: info.size,
            // BTreeMap<String, String> always serializes
            metadata_json: serde_json::to_string(&info.metadata).unwrap_or_default(),
            instructions: parse_instructions(&info.metadata),
            status: ProcessingStatus::Pending,
            storage_key: None,
            transcription: None,
            extracted_text: None,
            derived: Vec::new(),
            outcomes: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Normalized speech-to-text output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub words: Vec<Word>,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Segment {
    pub id: i64,
    pub seek: i64,
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub tokens: Vec<i64>,
    pub temperature: f64,
    pub avg_logprob: f64,
    pub compression_ratio: f64,
    pub no_speech_prob: f64,
}
