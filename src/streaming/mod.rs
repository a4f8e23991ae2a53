use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::schema::{SchemaViolation, ToolSchema, validate};

/// Default buffer of the producer-side chunk channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;
/// Largest single chunk a producer may emit or an accumulator accept.
pub const MAX_CHUNK_SIZE: usize = 10 * 1024 * 1024;
/// Largest total payload across a stream.
pub const MAX_STREAM_SIZE: usize = 100 * 1024 * 1024;
/// Default chunk-count bound of the accumulator.
pub const DEFAULT_MAX_CHUNKS: usize = 1000;
/// Default buffer bound of the progressive parameter parser.
pub const DEFAULT_PARSER_BUFFER: usize = 10 * 1024 * 1024;

/// Failures of the streaming primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("streaming context is closed")]
    ContextClosed,
    #[error("execution canceled")]
    Canceled,
    #[error("chunk size must be between 1 and {max} bytes, got {got}")]
    InvalidChunkSize { got: usize, max: usize },
    #[error("chunk of {size} bytes exceeds the maximum of {limit} bytes")]
    ChunkTooLarge { size: usize, limit: usize },
    #[error("stream exceeds the maximum of {limit} chunks")]
    TooManyChunks { limit: usize },
    #[error("stream of {size} bytes exceeds the maximum total of {limit} bytes")]
    StreamTooLarge { size: usize, limit: usize },
    #[error("serialized payload of {size} bytes exceeds the maximum of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("data chunk payload must be a string")]
    NonStringData,
    #[error("stream already completed")]
    AlreadyCompleted,
    #[error("stream is not complete")]
    NotComplete,
    #[error("stream error: {0}")]
    Failed(String),
}

/// Chunk discriminator. A `Complete` chunk (or an `Error` chunk followed by
/// channel close) terminates every stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Data,
    Metadata,
    Error,
    Complete,
}

/// A unit of streamed output with a per-stream monotonic index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    pub index: u64,
    pub timestamp: DateTime<Utc>,
}

impl StreamChunk {
    pub fn new(chunk_type: ChunkType, data: Value, index: u64) -> Self {
        Self {
            chunk_type,
            data,
            index,
            timestamp: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.chunk_type, ChunkType::Complete | ChunkType::Error)
    }
}

struct ContextState {
    index: u64,
    closed: bool,
    tx: Option<mpsc::Sender<StreamChunk>>,
}

/// Producer-side handle for emitting a chunk stream.
///
/// The index counter and closed flag live behind one async mutex, held
/// across the enqueue so concurrent producers cannot reorder indices.
pub struct StreamingContext {
    token: CancellationToken,
    state: Mutex<ContextState>,
}

impl StreamingContext {
    /// Create a context whose sends abort when `parent` is cancelled.
    /// Returns the consumer side of the chunk channel alongside.
    pub fn new(parent: &CancellationToken) -> (Self, mpsc::Receiver<StreamChunk>) {
        Self::with_capacity(parent, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(
        parent: &CancellationToken,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<StreamChunk>) {
        let (tx, rx) = mpsc::channel(capacity);
        let ctx = Self {
            token: parent.child_token(),
            state: Mutex::new(ContextState {
                index: 0,
                closed: false,
                tx: Some(tx),
            }),
        };
        (ctx, rx)
    }

    pub async fn send(&self, data: Value) -> Result<(), StreamError> {
        self.emit(ChunkType::Data, data).await
    }

    pub async fn send_error(&self, message: impl Into<String>) -> Result<(), StreamError> {
        self.emit(ChunkType::Error, Value::String(message.into()))
            .await
    }

    pub async fn send_metadata(
        &self,
        metadata: HashMap<String, Value>,
    ) -> Result<(), StreamError> {
        let map = metadata.into_iter().collect();
        self.emit(ChunkType::Metadata, Value::Object(map)).await
    }

    pub async fn complete(&self) -> Result<(), StreamError> {
        self.emit(ChunkType::Complete, Value::Null).await
    }

    async fn emit(&self, chunk_type: ChunkType, data: Value) -> Result<(), StreamError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::ContextClosed);
        }
        let tx = state.tx.clone().ok_or(StreamError::ContextClosed)?;
        let chunk = StreamChunk::new(chunk_type, data, state.index);
        state.index += 1;

        tokio::select! {
            sent = tx.send(chunk) => sent.map_err(|_| StreamError::ContextClosed),
            () = self.token.cancelled() => Err(StreamError::Canceled),
        }
    }

    /// Close the producer side. Idempotent; later sends fail with
    /// [`StreamError::ContextClosed`].
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.tx = None;
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

/// Helpers for producing bounded chunk streams from whole values or readers.
pub struct StreamingToolHelper;

impl StreamingToolHelper {
    fn check_chunk_size(chunk_size: usize) -> Result<(), StreamError> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(StreamError::InvalidChunkSize {
                got: chunk_size,
                max: MAX_CHUNK_SIZE,
            });
        }
        Ok(())
    }

    /// Serialize `value` to JSON and stream it as data chunks of at most
    /// `chunk_size` bytes (split at byte boundaries), terminated by a
    /// complete chunk. Precondition violations fail synchronously.
    pub fn stream_json(
        parent: &CancellationToken,
        value: &Value,
        chunk_size: usize,
    ) -> Result<mpsc::Receiver<StreamChunk>, StreamError> {
        Self::check_chunk_size(chunk_size)?;
        let bytes =
            serde_json::to_vec(value).map_err(|e| StreamError::Failed(e.to_string()))?;
        if bytes.len() > MAX_STREAM_SIZE {
            return Err(StreamError::PayloadTooLarge {
                size: bytes.len(),
                limit: MAX_STREAM_SIZE,
            });
        }

        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let token = parent.child_token();
        tokio::spawn(async move {
            let mut index = 0u64;
            for piece in bytes.chunks(chunk_size) {
                let data = Value::String(String::from_utf8_lossy(piece).into_owned());
                let chunk = StreamChunk::new(ChunkType::Data, data, index);
                index += 1;
                tokio::select! {
                    biased;
                    () = token.cancelled() => return,
                    sent = tx.send(chunk) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            let done = StreamChunk::new(ChunkType::Complete, Value::Null, index);
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                _ = tx.send(done) => {}
            }
        });
        Ok(rx)
    }

    /// Stream up to [`MAX_STREAM_SIZE`] bytes from `reader` as data chunks.
    /// EOF yields a complete chunk; a read error yields an error chunk.
    pub fn stream_reader<R>(
        parent: &CancellationToken,
        reader: R,
        chunk_size: usize,
    ) -> Result<mpsc::Receiver<StreamChunk>, StreamError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self::check_chunk_size(chunk_size)?;

        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let token = parent.child_token();
        let mut reader = reader;
        tokio::spawn(async move {
            let mut index = 0u64;
            let mut total = 0usize;
            let mut buf = vec![0u8; chunk_size];

            let send = |chunk: StreamChunk, tx: mpsc::Sender<StreamChunk>, token: CancellationToken| async move {
                tokio::select! {
                    biased;
                    () = token.cancelled() => false,
                    sent = tx.send(chunk) => sent.is_ok(),
                }
            };

            loop {
                if token.is_cancelled() {
                    return;
                }
                if total >= MAX_STREAM_SIZE {
                    let err = StreamError::StreamTooLarge {
                        size: total,
                        limit: MAX_STREAM_SIZE,
                    };
                    let chunk = StreamChunk::new(
                        ChunkType::Error,
                        Value::String(err.to_string()),
                        index,
                    );
                    send(chunk, tx.clone(), token.clone()).await;
                    return;
                }

                let cap = chunk_size.min(MAX_STREAM_SIZE - total);
                match reader.read(&mut buf[..cap]).await {
                    Ok(0) => {
                        let done = StreamChunk::new(ChunkType::Complete, Value::Null, index);
                        send(done, tx.clone(), token.clone()).await;
                        return;
                    }
                    Ok(n) => {
                        total += n;
                        let data =
                            Value::String(String::from_utf8_lossy(&buf[..n]).into_owned());
                        let chunk = StreamChunk::new(ChunkType::Data, data, index);
                        index += 1;
                        if !send(chunk, tx.clone(), token.clone()).await {
                            return;
                        }
                    }
                    Err(e) => {
                        let chunk = StreamChunk::new(
                            ChunkType::Error,
                            Value::String(e.to_string()),
                            index,
                        );
                        send(chunk, tx.clone(), token.clone()).await;
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Bounds enforced by [`StreamAccumulator`].
#[derive(Debug, Clone, Copy)]
pub struct AccumulatorLimits {
    pub max_chunks: usize,
    pub max_total_size: usize,
    pub max_chunk_size: usize,
}

impl Default for AccumulatorLimits {
    fn default() -> Self {
        Self {
            max_chunks: DEFAULT_MAX_CHUNKS,
            max_total_size: MAX_STREAM_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

#[derive(Default)]
struct AccumulatorState {
    pieces: Vec<String>,
    total_size: usize,
    metadata: HashMap<String, Value>,
    has_error: bool,
    error_message: Option<String>,
    complete: bool,
}

/// Consumer-side collector enforcing its own memory bounds, independent of
/// whatever the producer enforced (consumers may outlive producers).
#[derive(Default)]
pub struct StreamAccumulator {
    limits: AccumulatorLimits,
    state: std::sync::Mutex<AccumulatorState>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: AccumulatorLimits) -> Self {
        Self {
            limits,
            state: std::sync::Mutex::new(AccumulatorState::default()),
        }
    }

    /// Fold one chunk into the accumulator. A rejected chunk mutates
    /// nothing.
    pub fn add_chunk(&self, chunk: &StreamChunk) -> Result<(), StreamError> {
        let mut state = self.state.lock().expect("accumulator lock poisoned");
        if state.complete {
            return Err(StreamError::AlreadyCompleted);
        }

        match chunk.chunk_type {
            ChunkType::Data => {
                let Value::String(s) = &chunk.data else {
                    return Err(StreamError::NonStringData);
                };
                if state.pieces.len() + 1 > self.limits.max_chunks {
                    return Err(StreamError::TooManyChunks {
                        limit: self.limits.max_chunks,
                    });
                }
                if s.len() > self.limits.max_chunk_size {
                    return Err(StreamError::ChunkTooLarge {
                        size: s.len(),
                        limit: self.limits.max_chunk_size,
                    });
                }
                if state.total_size + s.len() > self.limits.max_total_size {
                    return Err(StreamError::StreamTooLarge {
                        size: state.total_size + s.len(),
                        limit: self.limits.max_total_size,
                    });
                }
                state.total_size += s.len();
                state.pieces.push(s.clone());
            }
            ChunkType::Metadata => {
                // Later entries overwrite earlier keys; non-mapping payloads
                // are tolerated.
                if let Value::Object(map) = &chunk.data {
                    for (k, v) in map {
                        state.metadata.insert(k.clone(), v.clone());
                    }
                }
            }
            ChunkType::Error => {
                state.has_error = true;
                if let Value::String(msg) = &chunk.data {
                    state.error_message = Some(msg.clone());
                }
            }
            ChunkType::Complete => {
                state.complete = true;
            }
        }
        Ok(())
    }

    /// The concatenated data and merged metadata of a completed stream.
    pub fn result(&self) -> Result<(String, HashMap<String, Value>), StreamError> {
        let state = self.state.lock().expect("accumulator lock poisoned");
        if state.has_error {
            let msg = state
                .error_message
                .clone()
                .unwrap_or_else(|| "unknown stream error".to_string());
            return Err(StreamError::Failed(msg));
        }
        if !state.complete {
            return Err(StreamError::NotComplete);
        }
        Ok((state.pieces.concat(), state.metadata.clone()))
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().expect("accumulator lock poisoned").complete
    }

    pub fn has_error(&self) -> bool {
        self.state.lock().expect("accumulator lock poisoned").has_error
    }

    pub fn chunk_count(&self) -> usize {
        self.state
            .lock()
            .expect("accumulator lock poisoned")
            .pieces
            .len()
    }
}

/// Accumulates textual JSON parameter chunks and parses them progressively.
///
/// The parser completes only when a full JSON document parses and passes
/// schema validation; validation failures keep the parser open for more
/// input.
pub struct StreamingParameterParser {
    schema: ToolSchema,
    buffer: String,
    max_buffer: usize,
    complete: bool,
}

impl StreamingParameterParser {
    pub fn new(schema: ToolSchema) -> Self {
        Self {
            schema,
            buffer: String::new(),
            max_buffer: DEFAULT_PARSER_BUFFER,
            complete: false,
        }
    }

    pub fn with_buffer_limit(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    pub fn add_chunk(&mut self, text: &str) -> Result<(), StreamError> {
        if self.complete {
            return Err(StreamError::AlreadyCompleted);
        }
        if self.buffer.len() + text.len() > self.max_buffer {
            return Err(StreamError::StreamTooLarge {
                size: self.buffer.len() + text.len(),
                limit: self.max_buffer,
            });
        }
        self.buffer.push_str(text);
        Ok(())
    }

    /// Attempt a full decode of the buffered text.
    ///
    /// `Ok(None)` means the buffer does not yet hold a complete JSON
    /// document; `Err` means it decoded but failed schema validation.
    pub fn try_parse(&mut self) -> Result<Option<Value>, SchemaViolation> {
        let Ok(value) = serde_json::from_str::<Value>(&self.buffer) else {
            return Ok(None);
        };
        validate(&self.schema, &value)?;
        self.complete = true;
        Ok(Some(value))
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Convenience wrapper over [`StreamingContext`] for result-shaped streams.
pub struct StreamingResultBuilder {
    ctx: StreamingContext,
}

impl StreamingResultBuilder {
    pub fn new(parent: &CancellationToken) -> (Self, mpsc::Receiver<StreamChunk>) {
        let (ctx, rx) = StreamingContext::new(parent);
        (Self { ctx }, rx)
    }

    /// Emit a metadata chunk carrying a nested progress object.
    pub async fn send_progress(
        &self,
        current: u64,
        total: u64,
        message: impl Into<String>,
    ) -> Result<(), StreamError> {
        let progress = serde_json::json!({
            "progress": {
                "current": current,
                "total": total,
                "message": message.into(),
            }
        });
        let Value::Object(map) = progress else {
            unreachable!()
        };
        self.ctx.send_metadata(map.into_iter().collect()).await
    }

    pub async fn send_partial_result(&self, data: Value) -> Result<(), StreamError> {
        self.ctx.send(data).await
    }

    /// Emit an optional final data chunk, a complete chunk, and close.
    pub async fn complete(&self, final_data: Option<Value>) -> Result<(), StreamError> {
        if let Some(data) = final_data {
            self.ctx.send(data).await?;
        }
        self.ctx.complete().await?;
        self.ctx.close().await;
        Ok(())
    }

    /// Emit an error chunk, then close the stream.
    pub async fn error(&self, message: impl Into<String>) -> Result<(), StreamError> {
        self.ctx.send_error(message).await?;
        self.ctx.close().await;
        Ok(())
    }

    /// Idempotent close of the underlying context.
    pub async fn close(&self) {
        self.ctx.close().await;
    }
}

#[cfg(test)]
mod tests;
