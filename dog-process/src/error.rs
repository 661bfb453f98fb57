use dog_upload::UploadError;
use thiserror::Error;

/// Result type for processing operations
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Errors raised while turning a completed upload into a finished artifact
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Processing record not found: {0}")]
    RecordNotFound(String),

    #[error("Upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Upstream request timed out")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record store error: {0}")]
    Store(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Instruction failed: {0}")]
    Instruction(String),

    #[error("Hook handler panicked: {0}")]
    Panicked(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProcessError {
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }

    pub fn record_not_found<S: Into<String>>(id: S) -> Self {
        Self::RecordNotFound(id.into())
    }

    pub fn instruction<S: Into<String>>(msg: S) -> Self {
        Self::Instruction(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::RecordNotFound(_) => true,
            Self::Upload(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Failures caused by the transcription service or the network in between
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::Timeout | Self::Http(_))
    }
}

impl From<reqwest::Error> for ProcessError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(err)
        }
    }
}
