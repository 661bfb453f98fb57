use std::time::Duration;

use crate::{ProcessError, ProcessResult};

/// OpenAI-compatible transcription endpoint
pub const DEFAULT_TRANSCRIPTION_ENDPOINT: &str = "https://api.openai.com/v1/audio/transcriptions";
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Settings for every part of the post-upload processing stack
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    pub dispatcher: DispatcherConfig,
    pub pipeline: PipelineConfig,
    pub transcription: TranscriptionConfig,
}

impl ProcessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `DOG_DISPATCH__*`, `DOG_PIPELINE__*` and `DOG_TRANSCRIPTION__*` overrides
    pub fn from_env() -> ProcessResult<Self> {
        Ok(Self {
            dispatcher: DispatcherConfig::from_env()?,
            pipeline: PipelineConfig::from_env()?,
            transcription: TranscriptionConfig::from_env()?,
        })
    }

    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_transcription(mut self, transcription: TranscriptionConfig) -> Self {
        self.transcription = transcription;
        self
    }
}

/// Hook dispatcher sizing
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of worker tasks; events for one upload id always land on the same worker
    pub workers: usize,
    /// Bounded queue length per worker
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> ProcessResult<Self> {
        let mut config = Self::default();
        if let Some(workers) = env_parse("DOG_DISPATCH__WORKERS")? {
            config = config.with_workers(workers);
        }
        if let Some(capacity) = env_parse("DOG_DISPATCH__QUEUE_CAPACITY")? {
            config = config.with_queue_capacity(capacity);
        }
        Ok(config)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

/// Instruction pipeline behaviour
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Any failed instruction fails the record, not only transcription
    pub strict: bool,
    /// Max bytes read by `extract_text`
    pub extract_text_limit: usize,
    /// Bounding box used by `thumbnail`
    pub thumbnail_size: (u32, u32),
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            strict: false,
            extract_text_limit: 1024 * 1024,
            thumbnail_size: (256, 256),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> ProcessResult<Self> {
        let mut config = Self::default();
        if let Some(strict) = env_parse("DOG_PIPELINE__STRICT")? {
            config.strict = strict;
        }
        if let Some(limit) = env_parse("DOG_PIPELINE__EXTRACT_TEXT_LIMIT")? {
            config.extract_text_limit = limit;
        }
        Ok(config)
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn with_extract_text_limit(mut self, limit: usize) -> Self {
        self.extract_text_limit = limit;
        self
    }

    pub fn with_thumbnail_size(mut self, width: u32, height: u32) -> Self {
        self.thumbnail_size = (width, height);
        self
    }
}

/// Streaming transcription proxy settings, passed explicitly to the client
#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    /// Whole-request timeout; large audio files take minutes
    pub timeout: Duration,
    /// Size of each body chunk read from the stored blob
    pub chunk_bytes: usize,
    /// Chunks buffered between the blob reader and the HTTP body
    pub pipe_depth: usize,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_TRANSCRIPTION_ENDPOINT.to_string(),
            api_key: None,
            model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            timeout: Duration::from_secs(600),
            chunk_bytes: 64 * 1024,
            pipe_depth: 4,
        }
    }
}

impl TranscriptionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> ProcessResult<Self> {
        let mut config = Self::default();
        if let Ok(endpoint) = std::env::var("DOG_TRANSCRIPTION__ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(key) = std::env::var("DOG_TRANSCRIPTION__API_KEY") {
            config.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Ok(model) = std::env::var("DOG_TRANSCRIPTION__MODEL") {
            config.model = model;
        }
        if let Some(secs) = env_parse::<u64>("DOG_TRANSCRIPTION__TIMEOUT_SECS")? {
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_api_key<S: Into<String>>(mut self, key: S) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_chunk_bytes(mut self, bytes: usize) -> Self {
        self.chunk_bytes = bytes.max(1);
        self
    }

    pub fn with_pipe_depth(mut self, depth: usize) -> Self {
        self.pipe_depth = depth.max(1);
        self
    }

    /// Upper bound on bytes held between the blob reader and the HTTP client
    pub fn max_buffered_bytes(&self) -> usize {
        (self.pipe_depth + 1) * self.chunk_bytes
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> ProcessResult<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ProcessError::Config(format!("{key} has an invalid value: {value}"))),
        Err(_) => Ok(None),
    }
}
