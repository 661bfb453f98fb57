//! # dog-upload: Resumable chunked-upload storage
//!
//! `dog-upload` is the storage backend behind a resumable (tus-style) upload
//! protocol. Each upload is a blob file plus a small JSON sidecar that durably
//! records the declared length, the current offset and the client metadata.
//!
//! ## Key Features
//!
//! - **Durable offsets**: the sidecar is replaced atomically after every chunk
//! - **Strict resumption**: chunks at a stale offset are rejected, never overlaid
//! - **Per-upload serialization**: concurrent writers to one id are queued, not raced
//! - **Optional capabilities**: termination, deferred length and concatenation
//! - **Lifecycle events**: created/completed/terminated channels for post-processing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_upload::prelude::*;
//! use std::io::Cursor;
//!
//! # #[tokio::main]
//! # async fn main() -> UploadResult<()> {
//! let config = UploadConfig::new().with_root_dir("./uploads");
//! let store = FileStore::new(config.clone()).await?;
//! let (events, _receivers) = event_channels(config.event_capacity);
//! let uploads = UploadCoordinator::new(store, config).with_events(events);
//!
//! let info = uploads
//!     .create(NewUpload::new().with_size(10).with_meta("filename", "talk.mp3"))
//!     .await?;
//! uploads.patch(&info.id, 0, Box::pin(Cursor::new(b"hello".to_vec()))).await?;
//! uploads.patch(&info.id, 5, Box::pin(Cursor::new(b"world".to_vec()))).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐
//! │ Protocol handler  │  ← HTTP verbs, headers (not part of this crate)
//! ├───────────────────┤
//! │ UploadCoordinator │  ← capability dispatch + lifecycle events
//! ├───────────────────┤
//! │ DataStore/Upload  │  ← storage primitives (FileStore)
//! └───────────────────┘
//! ```

mod config;
mod coordinator;
mod error;
mod events;
mod file_store;
pub mod metadata;
pub mod store;
mod types;

pub use config::UploadConfig;
pub use coordinator::UploadCoordinator;
pub use error::{ProtocolError, UploadError, UploadResult};
pub use events::{event_channels, EventReceivers, EventSenders, UploadEvent};
pub use file_store::{FileStore, FileUpload};
pub use metadata::{encode_upload_metadata, parse_upload_metadata};
pub use store::{
    ConcatableUpload, DataStore, LengthDeclarableUpload, StoreCapabilities, TerminatableUpload,
    Upload,
};
pub use types::{MetaData, NewUpload, UploadBody, UploadId, UploadInfo, UploadReader};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        event_channels, DataStore, FileStore, NewUpload, Upload, UploadConfig, UploadCoordinator,
        UploadError, UploadId, UploadInfo, UploadResult,
    };
}
