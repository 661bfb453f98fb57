//! Streaming proxy to an OpenAI-compatible speech-to-text endpoint.
//!
//! The stored blob is never loaded into memory. A producer task reads it in
//! fixed-size chunks into a bounded channel, and the receiving end is the
//! multipart file part of the outgoing request. At most
//! `(pipe_depth + 1) * chunk_bytes` bytes are in flight between the two.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dog_upload::UploadReader;
use parking_lot::Mutex;
use reqwest::multipart::{Form, Part};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

use crate::{ProcessError, ProcessResult, TranscriptionConfig, TranscriptionResult};

const RESPONSE_FORMAT: &str = "verbose_json";
const TIMESTAMP_GRANULARITY: &str = "word";
const DEFAULT_MIME: &str = "application/octet-stream";
/// Upstream error bodies are kept for diagnostics, up to this many bytes
const MAX_ERROR_BODY: usize = 4096;

/// Audio handed to a [`Transcriber`]
pub struct AudioSource {
    pub reader: UploadReader,
    pub filename: String,
    pub content_type: Option<String>,
}

impl AudioSource {
    pub fn new<S: Into<String>>(reader: UploadReader, filename: S) -> Self {
        Self {
            reader,
            filename: filename.into(),
            content_type: None,
        }
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Speech-to-text capability consumed by the pipeline
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: AudioSource) -> ProcessResult<TranscriptionResult>;
}

/// Bounded producer/consumer pipe from a blob reader to a request body
pub struct BodyPipe {
    stream: Option<ReceiverStream<io::Result<Bytes>>>,
    failure: Arc<Mutex<Option<io::Error>>>,
    producer: JoinHandle<()>,
}

impl BodyPipe {
    /// Start reading `reader` in `chunk_bytes` pieces, buffering at most `depth` chunks
    pub fn spawn(mut reader: UploadReader, chunk_bytes: usize, depth: usize) -> Self {
        let chunk_bytes = chunk_bytes.max(1);
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(depth.max(1));
        let failure = Arc::new(Mutex::new(None));
        let slot = failure.clone();

        let producer = tokio::spawn(async move {
            let mut total: u64 = 0;
            loop {
                let mut buf = BytesMut::with_capacity(chunk_bytes);
                match reader.read_buf(&mut buf).await {
                    Ok(0) => {
                        debug!(bytes = total, "Request body fully produced");
                        return;
                    }
                    Ok(n) => {
                        total += n as u64;
                        if tx.send(Ok(buf.freeze())).await.is_err() {
                            // Request was dropped (finished early, timed out or failed)
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, bytes = total, "Reading upload for request body failed");
                        let relay = io::Error::new(e.kind(), e.to_string());
                        *slot.lock() = Some(e);
                        // Fails the body instead of letting the upstream see a short file
                        let _ = tx.send(Err(relay)).await;
                        return;
                    }
                }
            }
        });

        Self {
            stream: Some(ReceiverStream::new(rx)),
            failure,
            producer,
        }
    }

    /// Consumer side; `None` once taken
    pub fn take_stream(&mut self) -> Option<ReceiverStream<io::Result<Bytes>>> {
        self.stream.take()
    }

    /// Consumer side wrapped as a streaming request body
    pub fn take_body(&mut self) -> Option<reqwest::Body> {
        self.take_stream().map(reqwest::Body::wrap_stream)
    }

    /// The read error that aborted the body, if any
    pub fn take_failure(&self) -> Option<io::Error> {
        self.failure.lock().take()
    }
}

impl Drop for BodyPipe {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

/// HTTP client for the transcription endpoint. Holds its own configuration;
/// there is no process-wide client or key.
#[derive(Clone)]
pub struct TranscriptionClient {
    http: reqwest::Client,
    config: TranscriptionConfig,
}

impl TranscriptionClient {
    pub fn new(config: TranscriptionConfig) -> ProcessResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProcessError::Config(format!("transcription client: {e}")))?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &TranscriptionConfig {
        &self.config
    }

    fn form(&self, body: reqwest::Body, filename: String, content_type: &str) -> ProcessResult<Form> {
        let mime = if content_type.contains('/') {
            content_type
        } else {
            DEFAULT_MIME
        };
        let file = Part::stream(body).file_name(filename).mime_str(mime)?;

        Ok(Form::new()
            .part("file", file)
            .text("model", self.config.model.clone())
            .text("response_format", RESPONSE_FORMAT)
            .text("timestamp_granularities[]", TIMESTAMP_GRANULARITY))
    }
}

#[async_trait]
impl Transcriber for TranscriptionClient {
    #[instrument(skip(self, audio), fields(filename = %audio.filename, endpoint = %self.config.endpoint))]
    async fn transcribe(&self, audio: AudioSource) -> ProcessResult<TranscriptionResult> {
        let mut pipe = BodyPipe::spawn(audio.reader, self.config.chunk_bytes, self.config.pipe_depth);
        let body = pipe
            .take_body()
            .ok_or_else(|| ProcessError::Internal("request body already taken".to_string()))?;
        let content_type = audio.content_type.as_deref().unwrap_or(DEFAULT_MIME);
        let form = self.form(body, audio.filename, content_type)?;

        let mut request = self.http.post(&self.config.endpoint).multipart(form);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Err(ProcessError::Timeout),
            Err(e) => {
                // A body failure shows up as a request error; report the read error itself
                if let Some(source) = pipe.take_failure() {
                    return Err(ProcessError::io("stream upload to transcription service", source));
                }
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut end = MAX_ERROR_BODY;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            warn!(status = status.as_u16(), "Transcription service rejected the request");
            return Err(ProcessError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        let result = parse_verbose_json(&bytes)?;
        info!(
            duration = result.duration,
            words = result.words.len(),
            segments = result.segments.len(),
            "Transcription received"
        );
        Ok(result)
    }
}

/// Parse a `verbose_json` transcription response. Only `text` is required.
pub fn parse_verbose_json(bytes: &[u8]) -> ProcessResult<TranscriptionResult> {
    Ok(serde_json::from_slice(bytes)?)
}
