use async_trait::async_trait;

use crate::{NewUpload, UploadBody, UploadId, UploadInfo, UploadReader, UploadResult};

/// Core upload storage operations - must be implemented by all storage backends
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Allocate an empty blob and persist its initial sidecar
    async fn new_upload(&self, upload: NewUpload) -> UploadResult<Box<dyn Upload>>;

    /// Bind a handle to an existing upload
    async fn get_upload(&self, id: &UploadId) -> UploadResult<Box<dyn Upload>>;

    /// Get store capabilities
    fn capabilities(&self) -> StoreCapabilities;
}

/// Handle bound to one upload id
#[async_trait]
pub trait Upload: Send + Sync {
    fn id(&self) -> &UploadId;

    /// Current durable state of the upload
    async fn info(&self) -> UploadResult<UploadInfo>;

    /// Append the body at `offset`, returning the number of bytes written.
    /// `offset` must equal the durable offset.
    async fn write_chunk(&self, offset: u64, body: UploadBody) -> UploadResult<u64>;

    /// Reader positioned at the start of the blob
    async fn reader(&self) -> UploadResult<UploadReader>;

    /// Mark the upload as finished. Calling it again is a no-op.
    async fn finish(&self) -> UploadResult<UploadInfo>;

    fn as_terminatable(&self) -> Option<&dyn TerminatableUpload> {
        None
    }

    fn as_length_declarable(&self) -> Option<&dyn LengthDeclarableUpload> {
        None
    }

    fn as_concatable(&self) -> Option<&dyn ConcatableUpload> {
        None
    }
}

/// Optional termination support
#[async_trait]
pub trait TerminatableUpload: Send + Sync {
    /// Delete blob and sidecar. Already missing files are not an error.
    async fn terminate(&self) -> UploadResult<()>;
}

/// Optional deferred-length support
#[async_trait]
pub trait LengthDeclarableUpload: Send + Sync {
    async fn declare_length(&self, length: u64) -> UploadResult<UploadInfo>;
}

/// Optional concatenation support
#[async_trait]
pub trait ConcatableUpload: Send + Sync {
    /// Copy each partial upload, in order, into this (final) upload
    async fn concatenate(&self, partials: &[UploadId]) -> UploadResult<UploadInfo>;
}

/// Store capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreCapabilities {
    pub terminate: bool,
    pub declare_length: bool,
    pub concatenate: bool,
}

impl StoreCapabilities {
    pub fn basic() -> Self {
        Self::default()
    }

    pub fn with_termination(mut self) -> Self {
        self.terminate = true;
        self
    }

    pub fn with_length_deferral(mut self) -> Self {
        self.declare_length = true;
        self
    }

    pub fn with_concatenation(mut self) -> Self {
        self.concatenate = true;
        self
    }

    /// Extension names as advertised by the protocol's `Tus-Extension` header
    pub fn extensions(&self) -> Vec<&'static str> {
        let mut extensions = vec!["creation"];
        if self.terminate {
            extensions.push("termination");
        }
        if self.declare_length {
            extensions.push("creation-defer-length");
        }
        if self.concatenate {
            extensions.push("concatenation");
        }
        extensions
    }
}
