//! # dog-process: Post-upload processing for DogRS
//!
//! Turns a completed resumable upload into a finished artifact. Lifecycle
//! events from [`dog_upload`] are routed to hook handlers, which keep a
//! processing record per upload, move the blob into permanent storage and run
//! the requested instructions (resize, thumbnail, text extraction and
//! speech-to-text transcription).
//!
//! ## Key Features
//!
//! - **Bounded dispatch**: a router plus a fixed worker pool with bounded queues
//! - **Per-upload ordering**: one worker per upload id, created before completed
//! - **Idempotent records**: status moves by compare-and-set, so redelivered events are harmless
//! - **Explicit outcomes**: every instruction reports succeeded, skipped or failed
//! - **Streaming transcription**: blobs are piped to the upstream API in fixed-size chunks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_process::prelude::*;
//! use dog_upload::{event_channels, DataStore, FileStore, UploadConfig, UploadCoordinator};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let upload_config = UploadConfig::from_env()?;
//! let config = ProcessConfig::from_env()?;
//!
//! let store = FileStore::new(upload_config.clone()).await?;
//! let (events, receivers) = event_channels(upload_config.event_capacity);
//! let uploads = UploadCoordinator::new(store.clone(), upload_config).with_events(events);
//!
//! let pipeline = Pipeline::new(Arc::new(LocalPermanentStore::new("./vault")), config.pipeline)
//!     .with_transcriber(Arc::new(TranscriptionClient::new(config.transcription)?));
//! let hooks = UploadHooks::new(
//!     Arc::new(MemoryRecordStore::new()),
//!     Arc::new(store) as Arc<dyn DataStore>,
//!     Arc::new(pipeline),
//! );
//!
//! let dispatcher = HookDispatcher::start(receivers, Arc::new(hooks), config.dispatcher);
//! // ... serve uploads through `uploads` ...
//! # drop(uploads);
//! dispatcher.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod config;
pub mod dispatcher;
mod error;
pub mod hooks;
pub mod instruction;
pub mod observability;
pub mod pipeline;
mod record;
pub mod record_store;
pub mod transcription;
pub mod vault;

pub use config::{
    DispatcherConfig, PipelineConfig, ProcessConfig, TranscriptionConfig,
    DEFAULT_TRANSCRIPTION_ENDPOINT, DEFAULT_TRANSCRIPTION_MODEL,
};
pub use dispatcher::{DispatcherHandle, DispatcherStats, HookDispatcher, HookEvent, HookHandler};
pub use error::{ProcessError, ProcessResult};
pub use hooks::UploadHooks;
pub use instruction::{parse_instructions, Instruction, InstructionOutcome};
pub use pipeline::{ImageOp, ImageTransform, Pipeline, PipelineReport};
pub use record::{ProcessingRecord, ProcessingStatus, Segment, TranscriptionResult, Word};
pub use record_store::{MemoryRecordStore, RecordEvent, RecordStore};
pub use transcription::{AudioSource, BodyPipe, Transcriber, TranscriptionClient};
pub use vault::{DefaultKeyStrategy, KeyStrategy, LocalPermanentStore, PermanentStore};

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

/// Prelude for wiring the processing stack
pub mod prelude {
    pub use crate::{
        HookDispatcher, HookHandler, LocalPermanentStore, MemoryRecordStore, Pipeline,
        ProcessConfig, ProcessError, ProcessResult, ProcessingRecord, ProcessingStatus,
        RecordStore, TranscriptionClient, UploadHooks,
    };

    pub use async_trait::async_trait;
}
