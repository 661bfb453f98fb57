use std::collections::HashMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_stream::StreamExt;

use dog_process::{
    AudioSource, BodyPipe, DispatcherConfig, DispatcherHandle, DispatcherStats, HookDispatcher,
    HookHandler, InstructionOutcome, LocalPermanentStore, MemoryRecordStore, PermanentStore,
    Pipeline, PipelineConfig, ProcessError, ProcessResult, ProcessingStatus, RecordEvent,
    RecordStore, Transcriber, TranscriptionClient, TranscriptionConfig, TranscriptionResult,
    UploadHooks,
};
use dog_upload::{
    event_channels, DataStore, FileStore, NewUpload, UploadBody, UploadConfig, UploadCoordinator,
    UploadId, UploadInfo,
};

/// What the mock transcription service received
#[derive(Debug, Default, Clone)]
struct Captured {
    fields: HashMap<String, String>,
    filename: Option<String>,
    content_type: Option<String>,
    file: Vec<u8>,
    auth: Option<String>,
}

#[derive(Clone)]
struct Upstream {
    status: StatusCode,
    delay: Duration,
    requests: Arc<Mutex<Vec<Captured>>>,
}

impl Upstream {
    fn responding(status: StatusCode) -> Self {
        Self {
            status,
            delay: Duration::ZERO,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn requests(&self) -> Vec<Captured> {
        self.requests.lock().clone()
    }
}

async fn mock_transcribe(
    State(upstream): State<Upstream>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    tokio::time::sleep(upstream.delay).await;

    let mut captured = Captured {
        auth: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        ..Default::default()
    };
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            captured.filename = field.file_name().map(String::from);
            captured.content_type = field.content_type().map(String::from);
            captured.file = field.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        } else {
            let value = field.text().await.unwrap_or_default();
            captured.fields.insert(name, value);
        }
    }
    upstream.requests.lock().push(captured);

    if upstream.status != StatusCode::OK {
        return (upstream.status, "model overloaded").into_response();
    }
    Json(json!({
        "task": "transcribe",
        "language": "english",
        "duration": 1.2,
        "text": "hello world",
        "segments": [{
            "id": 0, "seek": 0, "start": 0.0, "end": 1.2, "text": "hello world",
            "tokens": [1, 2], "temperature": 0.0, "avg_logprob": -0.1,
            "compression_ratio": 1.0, "no_speech_prob": 0.0
        }],
        "words": [
            {"word": "hello", "start": 0.0, "end": 0.5},
            {"word": "world", "start": 0.6, "end": 1.2}
        ]
    }))
    .into_response()
}

/// Serve the mock on an ephemeral port and return its endpoint URL
async fn spawn_upstream(upstream: Upstream) -> String {
    let app = Router::new()
        .route("/v1/audio/transcriptions", post(mock_transcribe))
        .with_state(upstream);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1/audio/transcriptions", addr)
}

/// Full stack: chunk store, coordinator, dispatcher, hooks, pipeline, vault
struct Harness {
    _chunks: tempfile::TempDir,
    _vault: tempfile::TempDir,
    store: FileStore,
    uploads: Option<UploadCoordinator>,
    records: Arc<MemoryRecordStore>,
    vault: Arc<LocalPermanentStore>,
    dispatcher: Option<DispatcherHandle>,
}

impl Harness {
    async fn start(transcription: TranscriptionConfig) -> Self {
        let chunks = tempfile::tempdir().unwrap();
        let vault_dir = tempfile::tempdir().unwrap();

        let upload_config = UploadConfig::new().with_root_dir(chunks.path());
        let store = FileStore::new(upload_config.clone()).await.unwrap();
        let (events, receivers) = event_channels(upload_config.event_capacity);
        let uploads = UploadCoordinator::new(store.clone(), upload_config).with_events(events);

        let records = Arc::new(MemoryRecordStore::new());
        let vault = Arc::new(LocalPermanentStore::new(vault_dir.path()));
        let pipeline = Pipeline::new(vault.clone(), PipelineConfig::default())
            .with_transcriber(Arc::new(TranscriptionClient::new(transcription).unwrap()));
        let hooks = UploadHooks::new(records.clone(), Arc::new(store.clone()), Arc::new(pipeline));
        let dispatcher = HookDispatcher::start(
            receivers,
            Arc::new(hooks),
            DispatcherConfig::new().with_workers(2),
        );

        Self {
            _chunks: chunks,
            _vault: vault_dir,
            store,
            uploads: Some(uploads),
            records,
            vault,
            dispatcher: Some(dispatcher),
        }
    }

    fn uploads(&self) -> &UploadCoordinator {
        self.uploads.as_ref().unwrap()
    }

    /// Close the event channels and wait for every hook to run
    async fn drain(&mut self) -> DispatcherStats {
        self.uploads.take();
        self.dispatcher.take().unwrap().join().await.unwrap()
    }
}

fn audio_upload(id: &str, size: u64) -> NewUpload {
    NewUpload::new()
        .with_id(id)
        .with_size(size)
        .with_meta("filename", "hello.wav")
        .with_meta("filetype", "audio/wav")
        .with_meta("user_id", "user-1")
        .with_meta("category", "voice-notes")
        .with_meta("processing", r#"["transcribe_audio"]"#)
}

fn body(bytes: &[u8]) -> UploadBody {
    Box::pin(Cursor::new(bytes.to_vec()))
}

fn status_changes(rx: &mut tokio::sync::broadcast::Receiver<RecordEvent>) -> Vec<(ProcessingStatus, ProcessingStatus)> {
    let mut changes = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let RecordEvent::StatusChanged { from, to, .. } = event {
            changes.push((from, to));
        }
    }
    changes
}

async fn upload_in_two_chunks(h: &Harness, id: &UploadId) {
    let created = h.uploads().create(audio_upload(id.as_str(), 10)).await.unwrap();
    assert_eq!(created.offset, 0);
    h.uploads().patch(id, 0, body(b"hello")).await.unwrap();
    let done = h.uploads().patch(id, 5, body(b"world")).await.unwrap();
    assert!(done.is_complete());
}

/// create u1 (10 bytes) → [0:5) → [5:10) → completed → pending → processing → completed
#[tokio::test]
async fn test_completed_upload_is_transcribed() {
    let upstream = Upstream::responding(StatusCode::OK);
    let endpoint = spawn_upstream(upstream.clone()).await;
    let mut h = Harness::start(
        TranscriptionConfig::new()
            .with_endpoint(endpoint)
            .with_api_key("test-key"),
    )
    .await;
    let mut record_events = h.records.subscribe();
    let id = UploadId::from("u1");

    upload_in_two_chunks(&h, &id).await;
    let stats = h.drain().await;
    assert_eq!(stats.handled, 2);
    assert_eq!(stats.failed, 0);

    let record = h.records.get(&id).await.unwrap();
    assert_eq!(record.status, ProcessingStatus::Completed);
    assert_eq!(record.category.as_deref(), Some("voice-notes"));
    assert_eq!(record.size, Some(10));
    assert!(record.error.is_none());
    assert_eq!(record.outcomes, vec![InstructionOutcome::succeeded("transcribe_audio")]);

    let transcription = record.transcription.clone().unwrap();
    assert_eq!(transcription.text, "hello world");
    assert_eq!(transcription.language.as_deref(), Some("english"));
    assert_eq!(transcription.words.len(), 2);
    assert_eq!(transcription.segments.len(), 1);

    assert_eq!(
        status_changes(&mut record_events),
        vec![
            (ProcessingStatus::Pending, ProcessingStatus::Processing),
            (ProcessingStatus::Processing, ProcessingStatus::Completed),
        ]
    );

    // The blob now lives in permanent storage only
    let key = record.storage_key.unwrap();
    assert!(key.starts_with("user-1/"));
    assert!(key.ends_with("/u1.wav"));
    assert!(h.vault.exists(&key).await.unwrap());
    assert!(h.store.get_upload(&id).await.err().unwrap().is_not_found());

    let requests = upstream.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.file, b"helloworld");
    assert_eq!(request.filename.as_deref(), Some("hello.wav"));
    assert_eq!(request.content_type.as_deref(), Some("audio/wav"));
    assert_eq!(request.fields["model"], "whisper-1");
    assert_eq!(request.fields["response_format"], "verbose_json");
    assert_eq!(request.fields["timestamp_granularities[]"], "word");
    assert_eq!(request.auth.as_deref(), Some("Bearer test-key"));
}

/// Partials pa + pb (3 bytes each) are left alone by the hooks; the final upload is processed
#[tokio::test]
async fn test_partials_survive_until_concatenation() {
    let upstream = Upstream::responding(StatusCode::OK);
    let endpoint = spawn_upstream(upstream.clone()).await;
    let mut h = Harness::start(TranscriptionConfig::new().with_endpoint(endpoint)).await;
    let parts = [UploadId::from("pa"), UploadId::from("pb")];

    for (id, bytes) in parts.iter().zip([&b"abc"[..], &b"def"[..]]) {
        h.uploads()
            .create(NewUpload::new().with_id(id.as_str()).with_size(3).partial())
            .await
            .unwrap();
        let done = h.uploads().patch(id, 0, body(bytes)).await.unwrap();
        assert!(done.is_complete());
    }
    // Let the dispatcher run the partials' completion hooks first
    tokio::time::sleep(Duration::from_millis(300)).await;
    for id in &parts {
        assert!(h.records.get(id).await.is_err());
        assert!(h.store.get_upload(id).await.is_ok());
    }

    let mut final_upload = audio_upload("joined", 0).concatenation_of(parts.to_vec());
    final_upload.size = None;
    let info = h.uploads().create(final_upload).await.unwrap();
    assert_eq!(info.size, Some(6));
    h.drain().await;

    let record = h.records.get(&info.id).await.unwrap();
    assert_eq!(record.status, ProcessingStatus::Completed);
    assert_eq!(record.transcription.unwrap().text, "hello world");
    assert_eq!(upstream.requests()[0].file, b"abcdef");

    for id in &parts {
        assert!(h.records.get(id).await.is_err());
        assert!(h.store.get_upload(id).await.is_err());
    }
}

/// Same flow, upstream answers 500: record fails with a message and no transcription
#[tokio::test]
async fn test_upstream_error_fails_record() {
    let upstream = Upstream::responding(StatusCode::INTERNAL_SERVER_ERROR);
    let endpoint = spawn_upstream(upstream.clone()).await;
    let mut h = Harness::start(TranscriptionConfig::new().with_endpoint(endpoint)).await;
    let mut record_events = h.records.subscribe();
    let id = UploadId::from("u1");

    upload_in_two_chunks(&h, &id).await;
    let stats = h.drain().await;
    assert_eq!(stats.failed, 0, "pipeline failures are recorded, not raised");

    let record = h.records.get(&id).await.unwrap();
    assert_eq!(record.status, ProcessingStatus::Failed);
    assert!(record.transcription.is_none());
    assert!(record.completed_at.is_some());

    let error = record.error.unwrap();
    assert!(error.contains("500"), "unexpected error: {error}");
    assert!(error.contains("model overloaded"), "unexpected error: {error}");
    assert!(record.outcomes[0].is_failed());

    assert_eq!(
        status_changes(&mut record_events),
        vec![
            (ProcessingStatus::Pending, ProcessingStatus::Processing),
            (ProcessingStatus::Processing, ProcessingStatus::Failed),
        ]
    );
    assert_eq!(upstream.requests().len(), 1);
}

#[tokio::test]
async fn test_upstream_timeout_fails_record() {
    let mut upstream = Upstream::responding(StatusCode::OK);
    upstream.delay = Duration::from_secs(5);
    let endpoint = spawn_upstream(upstream).await;
    let mut h = Harness::start(
        TranscriptionConfig::new()
            .with_endpoint(endpoint)
            .with_timeout(Duration::from_millis(200)),
    )
    .await;
    let id = UploadId::from("u1");

    upload_in_two_chunks(&h, &id).await;
    h.drain().await;

    let record = h.records.get(&id).await.unwrap();
    assert_eq!(record.status, ProcessingStatus::Failed);
    assert!(record.error.unwrap().contains("timed out"));
}

/// Terminating an upload removes its processing record
#[tokio::test]
async fn test_terminated_upload_drops_record() {
    let mut h = Harness::start(TranscriptionConfig::new().with_endpoint("http://127.0.0.1:9/")).await;
    let id = UploadId::from("u2");

    h.uploads().create(audio_upload("u2", 10)).await.unwrap();
    h.uploads().patch(&id, 0, body(b"hello")).await.unwrap();
    h.uploads().terminate(&id).await.unwrap();
    // Unknown ids are a no-op and emit nothing
    h.uploads().terminate(&UploadId::from("nope")).await.unwrap();

    let stats = h.drain().await;
    assert_eq!(stats.routed, 2);
    assert_eq!(stats.failed, 0);
    assert!(h.records.find(&id).await.unwrap().is_none());
}

struct CountingTranscriber {
    calls: AtomicUsize,
}

#[async_trait]
impl Transcriber for CountingTranscriber {
    async fn transcribe(&self, mut audio: AudioSource) -> ProcessResult<TranscriptionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut bytes = Vec::new();
        audio
            .reader
            .read_to_end(&mut bytes)
            .await
            .map_err(|e| ProcessError::io("read audio", e))?;
        Ok(TranscriptionResult {
            text: format!("{} bytes", bytes.len()),
            ..Default::default()
        })
    }
}

struct DirectHooks {
    _dirs: (tempfile::TempDir, tempfile::TempDir),
    store: FileStore,
    records: Arc<MemoryRecordStore>,
    transcriber: Arc<CountingTranscriber>,
    hooks: UploadHooks,
}

async fn direct_hooks() -> DirectHooks {
    let chunks = tempfile::tempdir().unwrap();
    let vault = tempfile::tempdir().unwrap();
    let store = FileStore::new(UploadConfig::new().with_root_dir(chunks.path()))
        .await
        .unwrap();
    let records = Arc::new(MemoryRecordStore::new());
    let transcriber = Arc::new(CountingTranscriber {
        calls: AtomicUsize::new(0),
    });
    let pipeline = Pipeline::new(
        Arc::new(LocalPermanentStore::new(vault.path())),
        PipelineConfig::default(),
    )
    .with_transcriber(transcriber.clone());
    let hooks = UploadHooks::new(records.clone(), Arc::new(store.clone()), Arc::new(pipeline));

    DirectHooks {
        _dirs: (chunks, vault),
        store,
        records,
        transcriber,
        hooks,
    }
}

async fn finished_upload(store: &FileStore, id: &str) -> UploadInfo {
    let upload = store.new_upload(audio_upload(id, 10)).await.unwrap();
    upload.write_chunk(0, body(b"helloworld")).await.unwrap();
    upload.finish().await.unwrap()
}

/// Redelivered events neither duplicate the record nor rerun the pipeline
#[tokio::test]
async fn test_redelivered_events_are_idempotent() {
    let t = direct_hooks().await;
    let info = finished_upload(&t.store, "u1").await;

    t.hooks.on_created(info.clone()).await.unwrap();
    t.hooks.on_created(info.clone()).await.unwrap();
    assert_eq!(t.records.len(), 1);

    let (first, second) = tokio::join!(
        t.hooks.on_completed(info.clone()),
        t.hooks.on_completed(info.clone()),
    );
    first.unwrap();
    second.unwrap();
    t.hooks.on_completed(info.clone()).await.unwrap();

    assert_eq!(t.transcriber.calls.load(Ordering::SeqCst), 1);
    let record = t.records.get(&info.id).await.unwrap();
    assert_eq!(record.status, ProcessingStatus::Completed);
    assert_eq!(record.outcomes.len(), 1);
    assert_eq!(record.transcription.unwrap().text, "10 bytes");
}

#[tokio::test]
async fn test_completed_without_record_is_not_found() {
    let t = direct_hooks().await;
    let info = finished_upload(&t.store, "u1").await;

    let err = t.hooks.on_completed(info).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(t.transcriber.calls.load(Ordering::SeqCst), 0);
}

/// A blob that cannot be moved fails the record and keeps the pipeline from running
#[tokio::test]
async fn test_failed_move_marks_record_failed() {
    let t = direct_hooks().await;
    let info = UploadInfo::new(UploadId::from("ghost"), Some(10), Default::default());
    t.hooks.on_created(info.clone()).await.unwrap();

    let err = t.hooks.on_completed(info.clone()).await.unwrap_err();
    assert!(err.is_not_found());

    let record = t.records.get(&info.id).await.unwrap();
    assert_eq!(record.status, ProcessingStatus::Failed);
    assert!(record.error.unwrap().starts_with("storage:"));
    assert_eq!(t.transcriber.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_terminated_without_record_is_ok() {
    let t = direct_hooks().await;
    let info = finished_upload(&t.store, "u1").await;

    t.hooks.on_created(info.clone()).await.unwrap();
    t.hooks.on_terminated(info.clone()).await.unwrap();
    t.hooks.on_terminated(info.clone()).await.unwrap();
    assert!(t.records.is_empty());
}

/// AsyncRead wrapper counting how many bytes were pulled from the source
struct CountingReader {
    inner: Cursor<Vec<u8>>,
    read: Arc<AtomicUsize>,
}

impl AsyncRead for CountingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            self.read.fetch_add(buf.filled().len() - before, Ordering::SeqCst);
        }
        poll
    }
}

/// A stalled consumer stops the producer after a bounded number of chunks
#[tokio::test]
async fn test_body_pipe_memory_is_bounded() {
    let config = TranscriptionConfig::new().with_chunk_bytes(1024).with_pipe_depth(4);
    let read = Arc::new(AtomicUsize::new(0));
    let reader = CountingReader {
        inner: Cursor::new(vec![7u8; 1 << 20]),
        read: read.clone(),
    };

    let mut pipe = BodyPipe::spawn(Box::pin(reader), config.chunk_bytes, config.pipe_depth);
    let mut stream = pipe.take_stream().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let buffered = read.load(Ordering::SeqCst);
    assert!(buffered > 0);
    assert!(
        buffered <= config.max_buffered_bytes(),
        "producer read {buffered} bytes ahead of the consumer"
    );

    let mut total = 0;
    while let Some(chunk) = stream.next().await {
        total += chunk.unwrap().len();
    }
    assert_eq!(total, 1 << 20);
    assert_eq!(read.load(Ordering::SeqCst), 1 << 20);
}

/// Bytes arrive upstream intact when the file spans many pipe chunks
#[tokio::test]
async fn test_large_file_streams_intact() {
    let upstream = Upstream::responding(StatusCode::OK);
    let endpoint = spawn_upstream(upstream.clone()).await;
    let client = TranscriptionClient::new(
        TranscriptionConfig::new()
            .with_endpoint(endpoint)
            .with_chunk_bytes(4096)
            .with_pipe_depth(2),
    )
    .unwrap();

    let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    let audio = AudioSource::new(Box::pin(Cursor::new(data.clone())), "long.mp3")
        .with_content_type("audio/mpeg");

    let result = client.transcribe(audio).await.unwrap();
    assert_eq!(result.text, "hello world");

    let requests = upstream.requests();
    assert_eq!(requests[0].file.len(), data.len());
    assert_eq!(requests[0].file, data);
    assert!(requests[0].auth.is_none());
}

/// A failing blob read aborts the request with the original I/O error
#[tokio::test]
async fn test_read_error_aborts_request() {
    let upstream = Upstream::responding(StatusCode::OK);
    let endpoint = spawn_upstream(upstream.clone()).await;
    let client = TranscriptionClient::new(TranscriptionConfig::new().with_endpoint(endpoint)).unwrap();

    let broken = tokio_test::io::Builder::new()
        .read(b"partial audio")
        .read_error(std::io::Error::new(std::io::ErrorKind::Other, "disk failure"))
        .build();

    let err = client
        .transcribe(AudioSource::new(Box::pin(broken), "broken.wav"))
        .await
        .unwrap_err();
    match err {
        ProcessError::Io { source, .. } => assert_eq!(source.to_string(), "disk failure"),
        other => panic!("expected the read error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_vault_copy_is_byte_identical() {
    let t = direct_hooks().await;
    let info = finished_upload(&t.store, "u9").await;
    t.hooks.on_created(info.clone()).await.unwrap();
    t.hooks.on_completed(info.clone()).await.unwrap();

    let record = t.records.get(&info.id).await.unwrap();
    let key = record.storage_key.unwrap();
    let mut stored = Vec::new();
    t.hooks
        .pipeline()
        .vault()
        .open(&key)
        .await
        .unwrap()
        .read_to_end(&mut stored)
        .await
        .unwrap();
    assert_eq!(stored, b"helloworld");
}
