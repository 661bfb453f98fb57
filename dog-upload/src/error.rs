use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors that can occur while storing or reading an upload
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Upload not found: {id}")]
    NotFound { id: String },

    #[error("Upload already exists: {id}")]
    AlreadyExists { id: String },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Operation not supported by this store: {capability}")]
    Unsupported { capability: &'static str },

    #[error("Storage error during {operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt sidecar for {id}: {source}")]
    Sidecar {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Offset and length violations. Rejected requests leave durable state untouched
/// and can be retried once the client has re-read the offset.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("offset mismatch: upload is at {expected}, chunk starts at {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },

    #[error("chunk exceeds declared upload length {size}")]
    SizeExceeded { size: u64 },

    #[error("upload length {length} exceeds the maximum of {max} bytes")]
    MaxSizeExceeded { length: u64, max: u64 },

    #[error("upload length already declared as {declared}")]
    LengthAlreadyDeclared { declared: u64 },

    #[error("upload length {length} is smaller than the current offset {offset}")]
    LengthBelowOffset { length: u64, offset: u64 },

    #[error("upload is incomplete: {offset} of {size} bytes received")]
    Incomplete { offset: u64, size: u64 },

    #[error("upload is already complete")]
    UploadComplete,

    #[error("final uploads cannot be modified")]
    ModifyFinal,

    #[error("upload {id} is not a partial upload")]
    NotPartial { id: String },

    #[error("malformed Upload-Metadata: {reason}")]
    InvalidMetadata { reason: String },
}

impl UploadError {
    /// Wrap an I/O failure with the operation it interrupted
    pub fn storage(operation: &'static str, source: std::io::Error) -> Self {
        Self::Storage { operation, source }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn unsupported(capability: &'static str) -> Self {
        Self::Unsupported { capability }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Protocol rejections and transient disk failures can be retried by the client
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Storage { .. })
    }
}
