use std::path::PathBuf;

use crate::{UploadError, UploadResult};

const ENV_PREFIX: &str = "DOG_UPLOAD__";

/// Configuration for the chunk store and its coordinator
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Directory holding blobs and their `.info` sidecars
    pub root_dir: PathBuf,

    /// Absolute max size allowed for a single upload (safety guard)
    pub max_upload_bytes: Option<u64>,

    /// Buffer used when copying request bodies and partial uploads
    pub copy_buffer_bytes: usize,

    /// Capacity of each lifecycle event channel
    pub event_capacity: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./uploads"),
            max_upload_bytes: Some(5 * 1024 * 1024 * 1024), // 5GB
            copy_buffer_bytes: 64 * 1024,
            event_capacity: 256,
        }
    }
}

impl UploadConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load overrides from `DOG_UPLOAD__*` environment variables
    pub fn from_env() -> UploadResult<Self> {
        let mut config = Self::default();

        if let Some(dir) = env_var("ROOT_DIR") {
            config.root_dir = PathBuf::from(dir);
        }
        if let Some(max) = env_var("MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = if max == "0" {
                None
            } else {
                Some(parse_env("MAX_UPLOAD_BYTES", &max)?)
            };
        }
        if let Some(buffer) = env_var("COPY_BUFFER_BYTES") {
            config.copy_buffer_bytes = parse_env("COPY_BUFFER_BYTES", &buffer)?;
        }
        if let Some(capacity) = env_var("EVENT_CAPACITY") {
            config.event_capacity = parse_env("EVENT_CAPACITY", &capacity)?;
        }

        Ok(config)
    }

    /// Set the storage directory
    pub fn with_root_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.root_dir = dir.into();
        self
    }

    /// Set max upload size
    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = Some(bytes);
        self
    }

    /// Remove the upload size guard
    pub fn unlimited(mut self) -> Self {
        self.max_upload_bytes = None;
        self
    }

    pub fn with_copy_buffer(mut self, bytes: usize) -> Self {
        self.copy_buffer_bytes = bytes.max(1);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}")).ok()
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> UploadResult<T> {
    value.parse().map_err(|_| {
        UploadError::invalid(format!("{ENV_PREFIX}{key} has an invalid value: {value}"))
    })
}
