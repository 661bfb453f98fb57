use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

use crate::{
    ConcatableUpload, DataStore, LengthDeclarableUpload, NewUpload, ProtocolError,
    StoreCapabilities, TerminatableUpload, Upload, UploadBody, UploadConfig, UploadError, UploadId,
    UploadInfo, UploadReader, UploadResult,
};

/// Chunk store on a single local disk: one blob file plus one `.info` sidecar per upload
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<FileStoreInner>,
}

struct FileStoreInner {
    root: PathBuf,
    config: UploadConfig,
    /// Per-id write locks; every mutation of a blob/sidecar pair holds its id's lock
    locks: DashMap<UploadId, Arc<Mutex<()>>>,
}

impl FileStore {
    /// Open (and create if needed) the store directory
    pub async fn new(config: UploadConfig) -> UploadResult<Self> {
        fs::create_dir_all(&config.root_dir)
            .await
            .map_err(|e| UploadError::storage("create store directory", e))?;

        Ok(Self {
            inner: Arc::new(FileStoreInner {
                root: config.root_dir.clone(),
                config,
                locks: DashMap::new(),
            }),
        })
    }

    pub fn config(&self) -> &UploadConfig {
        &self.inner.config
    }

    /// Path of the blob file for `id`
    pub fn blob_path(&self, id: &UploadId) -> PathBuf {
        self.inner.blob_path(id)
    }

    /// Path of the sidecar for `id`
    pub fn info_path(&self, id: &UploadId) -> PathBuf {
        self.inner.info_path(id)
    }

    fn handle(&self, id: UploadId) -> FileUpload {
        FileUpload {
            store: self.inner.clone(),
            id,
        }
    }
}

#[async_trait]
impl DataStore for FileStore {
    #[instrument(skip(self, upload), fields(size = ?upload.size))]
    async fn new_upload(&self, upload: NewUpload) -> UploadResult<Box<dyn Upload>> {
        let info = upload.into_info();
        self.inner.create(&info).await?;
        Ok(Box::new(self.handle(info.id)))
    }

    async fn get_upload(&self, id: &UploadId) -> UploadResult<Box<dyn Upload>> {
        if !id.is_valid() {
            return Err(UploadError::not_found(id.as_str()));
        }
        // Fail early for unknown ids so handles always point at a real upload
        self.inner.read_info(id).await?;
        Ok(Box::new(self.handle(id.clone())))
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::basic()
            .with_termination()
            .with_length_deferral()
            .with_concatenation()
    }
}

impl FileStoreInner {
    fn blob_path(&self, id: &UploadId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn info_path(&self, id: &UploadId) -> PathBuf {
        self.root.join(format!("{}.info", id))
    }

    fn info_tmp_path(&self, id: &UploadId) -> PathBuf {
        self.root.join(format!("{}.info.tmp", id))
    }

    fn concat_tmp_path(&self, id: &UploadId) -> PathBuf {
        self.root.join(format!("{}.concat.tmp", id))
    }

    async fn lock(&self, id: &UploadId) -> IdGuard<'_> {
        let lock = self.locks.entry(id.clone()).or_default().clone();
        IdGuard {
            locks: &self.locks,
            id: id.clone(),
            _guard: lock.lock_owned().await,
        }
    }

    fn check_max(&self, length: u64) -> UploadResult<()> {
        match self.config.max_upload_bytes {
            Some(max) if length > max => {
                Err(ProtocolError::MaxSizeExceeded { length, max }.into())
            }
            _ => Ok(()),
        }
    }

    async fn read_info(&self, id: &UploadId) -> UploadResult<UploadInfo> {
        let bytes = match fs::read(self.info_path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(UploadError::not_found(id.as_str()))
            }
            Err(e) => return Err(UploadError::storage("read sidecar", e)),
        };

        serde_json::from_slice(&bytes).map_err(|source| UploadError::Sidecar {
            id: id.to_string(),
            source,
        })
    }

    /// Write to a temp file, sync it, then rename over the old sidecar.
    /// A crash leaves either the previous or the new sidecar, never a torn one.
    async fn write_info(&self, info: &UploadInfo) -> UploadResult<()> {
        let bytes = serde_json::to_vec_pretty(info).map_err(|source| UploadError::Sidecar {
            id: info.id.to_string(),
            source,
        })?;

        let tmp = self.info_tmp_path(&info.id);
        let mut file = File::create(&tmp)
            .await
            .map_err(|e| UploadError::storage("create sidecar", e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| UploadError::storage("write sidecar", e))?;
        file.sync_all()
            .await
            .map_err(|e| UploadError::storage("sync sidecar", e))?;
        drop(file);

        fs::rename(&tmp, self.info_path(&info.id))
            .await
            .map_err(|e| UploadError::storage("replace sidecar", e))
    }

    async fn create(&self, info: &UploadInfo) -> UploadResult<()> {
        if !info.id.is_valid() {
            return Err(UploadError::invalid(format!("invalid upload id: {}", info.id)));
        }
        if info.is_final && info.is_partial {
            return Err(UploadError::invalid("an upload cannot be both partial and final"));
        }
        if info.is_final && info.partial_uploads.is_empty() {
            return Err(UploadError::invalid("a final upload needs at least one partial upload"));
        }
        if let Some(size) = info.size {
            self.check_max(size)?;
        }

        let _guard = self.lock(&info.id).await;

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.blob_path(&info.id))
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(UploadError::AlreadyExists {
                    id: info.id.to_string(),
                })
            }
            Err(e) => return Err(UploadError::storage("create blob", e)),
        }

        self.write_info(info).await?;
        debug!(upload_id = %info.id, "Created upload");
        Ok(())
    }

    async fn write_chunk(&self, id: &UploadId, offset: u64, mut body: UploadBody) -> UploadResult<u64> {
        let _guard = self.lock(id).await;
        let mut info = self.read_info(id).await?;

        if info.is_final {
            return Err(ProtocolError::ModifyFinal.into());
        }
        if info.offset != offset {
            return Err(ProtocolError::OffsetMismatch {
                expected: info.offset,
                actual: offset,
            }
            .into());
        }
        if info.is_complete() {
            return Err(ProtocolError::UploadComplete.into());
        }

        let limit = match info.size {
            Some(size) => size - info.offset,
            None => self
                .config
                .max_upload_bytes
                .map_or(u64::MAX, |max| max.saturating_sub(info.offset)),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .open(self.blob_path(id))
            .await
            .map_err(|e| UploadError::storage("open blob", e))?;
        // Drop bytes past the durable offset left behind by an interrupted write
        file.set_len(offset)
            .await
            .map_err(|e| UploadError::storage("truncate blob", e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| UploadError::storage("seek blob", e))?;

        let copied = copy_bounded(&mut body, &mut file, limit, self.config.copy_buffer_bytes).await;

        if copied.overflow {
            file.set_len(offset)
                .await
                .map_err(|e| UploadError::storage("truncate blob", e))?;
            warn!(upload_id = %id, offset, "Rejected chunk past the upload length");
            return Err(match info.size {
                Some(size) => ProtocolError::SizeExceeded { size },
                None => ProtocolError::MaxSizeExceeded {
                    length: offset.saturating_add(copied.written).saturating_add(1),
                    max: self.config.max_upload_bytes.unwrap_or(u64::MAX),
                },
            }
            .into());
        }

        file.flush()
            .await
            .map_err(|e| UploadError::storage("flush blob", e))?;
        file.sync_data()
            .await
            .map_err(|e| UploadError::storage("sync blob", e))?;

        if copied.written > 0 {
            info.offset += copied.written;
            info.touch();
            self.write_info(&info).await?;
        }

        debug!(
            upload_id = %id,
            offset = info.offset,
            written = copied.written,
            "Wrote chunk"
        );

        match copied.error {
            // Progress up to the failure stays durable so the client can resume
            Some(e) => Err(UploadError::storage("copy chunk body", e)),
            None => Ok(copied.written),
        }
    }

    async fn finish(&self, id: &UploadId) -> UploadResult<UploadInfo> {
        let _guard = self.lock(id).await;
        let mut info = self.read_info(id).await?;

        match info.size {
            None => {
                info.size = Some(info.offset);
                info.touch();
                self.write_info(&info).await?;
            }
            Some(size) if size != info.offset => {
                return Err(ProtocolError::Incomplete {
                    offset: info.offset,
                    size,
                }
                .into())
            }
            Some(_) => {}
        }

        Ok(info)
    }

    async fn terminate(&self, id: &UploadId) -> UploadResult<()> {
        let guard = self.lock(id).await;

        for path in [
            self.blob_path(id),
            self.info_path(id),
            self.info_tmp_path(id),
            self.concat_tmp_path(id),
        ] {
            remove_if_exists(&path).await?;
        }

        drop(guard);
        debug!(upload_id = %id, "Terminated upload");
        Ok(())
    }

    async fn declare_length(&self, id: &UploadId, length: u64) -> UploadResult<UploadInfo> {
        let _guard = self.lock(id).await;
        let mut info = self.read_info(id).await?;

        match info.size {
            Some(declared) if declared == length => return Ok(info),
            Some(declared) => return Err(ProtocolError::LengthAlreadyDeclared { declared }.into()),
            None => {}
        }
        if length < info.offset {
            return Err(ProtocolError::LengthBelowOffset {
                length,
                offset: info.offset,
            }
            .into());
        }
        self.check_max(length)?;

        info.size = Some(length);
        info.touch();
        self.write_info(&info).await?;
        Ok(info)
    }

    async fn concatenate(&self, id: &UploadId, partials: &[UploadId]) -> UploadResult<UploadInfo> {
        if partials.is_empty() {
            return Err(UploadError::invalid("nothing to concatenate"));
        }
        if partials.contains(id) {
            return Err(UploadError::invalid("an upload cannot contain itself"));
        }

        let _guard = self.lock(id).await;
        let mut info = self.read_info(id).await?;
        if info.offset != 0 {
            return Err(ProtocolError::UploadComplete.into());
        }

        // Validate every part before copying anything
        let mut total: u64 = 0;
        for partial in partials {
            let part = self.read_info(partial).await?;
            if !part.is_partial {
                return Err(ProtocolError::NotPartial {
                    id: partial.to_string(),
                }
                .into());
            }
            let size = part.size.filter(|_| part.is_complete()).ok_or(
                ProtocolError::Incomplete {
                    offset: part.offset,
                    size: part.size.unwrap_or(0),
                },
            )?;
            total = total.saturating_add(size);
        }
        self.check_max(total)?;

        let tmp = self.concat_tmp_path(id);
        let copied = match self.copy_partials(&tmp, partials).await {
            Ok(copied) => copied,
            Err(e) => {
                if let Err(cleanup) = remove_if_exists(&tmp).await {
                    warn!(upload_id = %id, error = %cleanup, "Failed to remove concatenation temp file");
                }
                return Err(e);
            }
        };

        fs::rename(&tmp, self.blob_path(id))
            .await
            .map_err(|e| UploadError::storage("replace blob", e))?;

        info.size = Some(copied);
        info.offset = copied;
        info.is_final = true;
        info.partial_uploads = partials.to_vec();
        info.touch();
        self.write_info(&info).await?;

        debug!(upload_id = %id, parts = partials.len(), size = copied, "Concatenated upload");
        Ok(info)
    }

    async fn copy_partials(&self, tmp: &Path, partials: &[UploadId]) -> UploadResult<u64> {
        let mut out = File::create(tmp)
            .await
            .map_err(|e| UploadError::storage("create concatenation file", e))?;

        let mut total = 0;
        for partial in partials {
            let file = File::open(self.blob_path(partial)).await.map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    UploadError::not_found(partial.as_str())
                } else {
                    UploadError::storage("open partial upload", e)
                }
            })?;
            let mut reader = BufReader::with_capacity(self.config.copy_buffer_bytes, file);
            total += tokio::io::copy_buf(&mut reader, &mut out)
                .await
                .map_err(|e| UploadError::storage("copy partial upload", e))?;
        }

        out.sync_all()
            .await
            .map_err(|e| UploadError::storage("sync concatenation file", e))?;
        Ok(total)
    }
}

/// Holds an id's write lock. On release the table entry is pruned when no other
/// task holds or waits on the same mutex, so the table only tracks ids in use.
struct IdGuard<'a> {
    locks: &'a DashMap<UploadId, Arc<Mutex<()>>>,
    id: UploadId,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        // Runs before `_guard` unlocks: one reference is the table's, one is ours.
        // Anyone else queued on this mutex keeps the entry alive.
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

async fn remove_if_exists(path: &Path) -> UploadResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(UploadError::storage("remove file", e)),
    }
}

struct Copied {
    written: u64,
    overflow: bool,
    error: Option<std::io::Error>,
}

/// Copy at most `limit` bytes. `overflow` is set when the reader still had data afterwards.
async fn copy_bounded<R, W>(reader: &mut R, writer: &mut W, limit: u64, buffer: usize) -> Copied
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer.max(1)];
    let mut copied = Copied {
        written: 0,
        overflow: false,
        error: None,
    };

    while copied.written < limit {
        let want = buf.len().min((limit - copied.written).min(usize::MAX as u64) as usize);
        let n = match reader.read(&mut buf[..want]).await {
            Ok(0) => return copied,
            Ok(n) => n,
            Err(e) => {
                copied.error = Some(e);
                return copied;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            copied.error = Some(e);
            return copied;
        }
        copied.written += n as u64;
    }

    let mut probe = [0u8; 1];
    match reader.read(&mut probe).await {
        Ok(0) => {}
        Ok(_) => copied.overflow = true,
        Err(e) => copied.error = Some(e),
    }
    copied
}

/// Handle bound to one upload in a [`FileStore`]
pub struct FileUpload {
    store: Arc<FileStoreInner>,
    id: UploadId,
}

#[async_trait]
impl Upload for FileUpload {
    fn id(&self) -> &UploadId {
        &self.id
    }

    async fn info(&self) -> UploadResult<UploadInfo> {
        self.store.read_info(&self.id).await
    }

    #[instrument(skip(self, body), fields(upload_id = %self.id))]
    async fn write_chunk(&self, offset: u64, body: UploadBody) -> UploadResult<u64> {
        self.store.write_chunk(&self.id, offset, body).await
    }

    async fn reader(&self) -> UploadResult<UploadReader> {
        let file = File::open(self.store.blob_path(&self.id))
            .await
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    UploadError::not_found(self.id.as_str())
                } else {
                    UploadError::storage("open blob", e)
                }
            })?;
        Ok(Box::pin(file))
    }

    async fn finish(&self) -> UploadResult<UploadInfo> {
        self.store.finish(&self.id).await
    }

    fn as_terminatable(&self) -> Option<&dyn TerminatableUpload> {
        Some(self)
    }

    fn as_length_declarable(&self) -> Option<&dyn LengthDeclarableUpload> {
        Some(self)
    }

    fn as_concatable(&self) -> Option<&dyn ConcatableUpload> {
        Some(self)
    }
}

#[async_trait]
impl TerminatableUpload for FileUpload {
    async fn terminate(&self) -> UploadResult<()> {
        self.store.terminate(&self.id).await
    }
}

#[async_trait]
impl LengthDeclarableUpload for FileUpload {
    async fn declare_length(&self, length: u64) -> UploadResult<UploadInfo> {
        self.store.declare_length(&self.id, length).await
    }
}

#[async_trait]
impl ConcatableUpload for FileUpload {
    async fn concatenate(&self, partials: &[UploadId]) -> UploadResult<UploadInfo> {
        self.store.concatenate(&self.id, partials).await
    }
}
