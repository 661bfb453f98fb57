use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use tokio::io::AsyncRead;
use uuid::Uuid;

/// Request body handed to a chunk write
pub type UploadBody = Pin<Box<dyn AsyncRead + Send>>;

/// Reader over a stored blob, positioned at its first byte
pub type UploadReader = Pin<Box<dyn AsyncRead + Send>>;

/// Free-form, string-keyed upload metadata
pub type MetaData = BTreeMap<String, String>;

/// Unique identifier for an upload session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(pub String);

impl UploadId {
    /// Generate a new random upload ID
    pub fn new() -> Self {
        Self(format!("upl_{}", Uuid::new_v4().simple()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids become file names, so only a conservative alphabet is accepted
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 128
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UploadId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UploadId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Durable description of an upload. This is exactly what the `.info` sidecar holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub id: UploadId,
    /// Declared total length; `None` while the length is deferred
    pub size: Option<u64>,
    /// Bytes durably written
    pub offset: u64,
    #[serde(default)]
    pub metadata: MetaData,
    #[serde(default)]
    pub is_partial: bool,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub partial_uploads: Vec<UploadId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadInfo {
    pub fn new(id: UploadId, size: Option<u64>, metadata: MetaData) -> Self {
        let now = Utc::now();
        Self {
            id,
            size,
            offset: 0,
            metadata,
            is_partial: false,
            is_final: false,
            partial_uploads: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Complete iff the size is known and every byte has been written
    pub fn is_complete(&self) -> bool {
        self.size == Some(self.offset)
    }

    pub fn size_is_deferred(&self) -> bool {
        self.size.is_none()
    }

    /// Bytes still expected, if the size is known
    pub fn remaining(&self) -> Option<u64> {
        self.size.map(|size| size.saturating_sub(self.offset))
    }

    pub fn filename(&self) -> Option<&str> {
        self.metadata.get("filename").map(String::as_str)
    }

    /// Content type as sent by the client (`filetype`, falling back to `content_type`)
    pub fn content_type(&self) -> Option<&str> {
        self.metadata
            .get("filetype")
            .or_else(|| self.metadata.get("content_type"))
            .map(String::as_str)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Request to create an upload
#[derive(Debug, Clone, Default)]
pub struct NewUpload {
    pub id: Option<UploadId>,
    pub size: Option<u64>,
    pub metadata: MetaData,
    pub is_partial: bool,
    pub is_final: bool,
    pub partial_uploads: Vec<UploadId>,
}

impl NewUpload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id<I: Into<UploadId>>(mut self, id: I) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_metadata(mut self, metadata: MetaData) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_meta<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Mark as one constituent of a later concatenation
    pub fn partial(mut self) -> Self {
        self.is_partial = true;
        self
    }

    /// Final upload assembled from `parts`, in order
    pub fn concatenation_of(mut self, parts: Vec<UploadId>) -> Self {
        self.is_final = true;
        self.partial_uploads = parts;
        self
    }

    pub(crate) fn into_info(self) -> UploadInfo {
        let mut info = UploadInfo::new(self.id.unwrap_or_default(), self.size, self.metadata);
        info.is_partial = self.is_partial;
        info.is_final = self.is_final;
        info.partial_uploads = self.partial_uploads;
        info
    }
}
