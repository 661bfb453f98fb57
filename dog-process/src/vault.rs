//! Permanent storage for finished uploads.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use dog_upload::{UploadId, UploadReader};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{ProcessError, ProcessResult};

/// Where finished blobs and their derived artifacts live
#[async_trait]
pub trait PermanentStore: Send + Sync {
    /// Stream `reader` to `key`, returning the number of bytes stored
    async fn put(&self, key: &str, reader: UploadReader) -> ProcessResult<u64>;

    async fn open(&self, key: &str) -> ProcessResult<UploadReader>;

    /// Returns whether something was removed
    async fn delete(&self, key: &str) -> ProcessResult<bool>;

    async fn exists(&self, key: &str) -> ProcessResult<bool>;
}

/// Permanent store on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalPermanentStore {
    root: PathBuf,
}

impl LocalPermanentStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key below the root; absolute keys and `..` are rejected
    pub fn path_for(&self, key: &str) -> ProcessResult<PathBuf> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(ProcessError::Store(format!("invalid storage key: {key}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl PermanentStore for LocalPermanentStore {
    async fn put(&self, key: &str, mut reader: UploadReader) -> ProcessResult<u64> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ProcessError::io("create storage directory", e))?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(".part");
        let tmp = PathBuf::from(tmp);
        let mut file = File::create(&tmp)
            .await
            .map_err(|e| ProcessError::io("create stored file", e))?;

        let written = match tokio::io::copy(&mut reader, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&tmp).await;
                return Err(ProcessError::io("copy into permanent storage", e));
            }
        };

        file.flush()
            .await
            .map_err(|e| ProcessError::io("flush stored file", e))?;
        file.sync_all()
            .await
            .map_err(|e| ProcessError::io("sync stored file", e))?;
        drop(file);

        fs::rename(&tmp, &path)
            .await
            .map_err(|e| ProcessError::io("publish stored file", e))?;

        debug!(key, bytes = written, "Stored object");
        Ok(written)
    }

    async fn open(&self, key: &str) -> ProcessResult<UploadReader> {
        let file = File::open(self.path_for(key)?).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ProcessError::Store(format!("object not found: {key}"))
            } else {
                ProcessError::io("open stored file", e)
            }
        })?;
        Ok(Box::pin(file))
    }

    async fn delete(&self, key: &str) -> ProcessResult<bool> {
        match fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ProcessError::io("delete stored file", e)),
        }
    }

    async fn exists(&self, key: &str) -> ProcessResult<bool> {
        fs::try_exists(self.path_for(key)?)
            .await
            .map_err(|e| ProcessError::io("stat stored file", e))
    }
}

/// Naming scheme for stored objects
pub trait KeyStrategy: Send + Sync {
    fn object_key(&self, user_id: Option<&str>, upload_id: &UploadId, filename: Option<&str>) -> String;

    /// Key of an artifact derived from `key`, e.g. a thumbnail
    fn derived_key(&self, key: &str, kind: &str) -> String {
        format!("{key}.{kind}")
    }
}

/// `<user|anonymous>/<yyyy>/<mm>/<upload_id>[.<ext>]`
#[derive(Debug, Clone, Default)]
pub struct DefaultKeyStrategy;

impl DefaultKeyStrategy {
    pub fn object_key_at(
        &self,
        user_id: Option<&str>,
        upload_id: &UploadId,
        filename: Option<&str>,
        at: DateTime<Utc>,
    ) -> String {
        let owner = user_id
            .map(sanitize_segment)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "anonymous".to_string());

        let mut key = format!("{}/{:04}/{:02}/{}", owner, at.year(), at.month(), upload_id);
        if let Some(ext) = filename.and_then(extension) {
            key.push('.');
            key.push_str(&ext);
        }
        key
    }
}

impl KeyStrategy for DefaultKeyStrategy {
    fn object_key(&self, user_id: Option<&str>, upload_id: &UploadId, filename: Option<&str>) -> String {
        self.object_key_at(user_id, upload_id, filename, Utc::now())
    }
}

fn sanitize_segment(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

/// Lowercased extension of a client file name, if it looks like one
fn extension(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 10 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
