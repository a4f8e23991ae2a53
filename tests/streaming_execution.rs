use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tooldock::{
    ChunkType, ExecutionEngine, ExecutionResult, ExecutionScope, PropertySchema,
    StreamAccumulator, StreamChunk, StreamError, StreamingContext, StreamingExecutor,
    StreamingToolHelper, Tool, ToolExecutor, ToolRegistry, ToolSchema,
};

mod common;

/// Streaming tool emitting `count` data chunks then a complete chunk.
struct CountingStreamTool;

#[async_trait]
impl ToolExecutor for CountingStreamTool {
    async fn execute(
        &self,
        _params: Value,
        _scope: &ExecutionScope,
    ) -> anyhow::Result<Option<ExecutionResult>> {
        Ok(None)
    }

    fn streaming(&self) -> Option<&dyn StreamingExecutor> {
        Some(self)
    }
}

#[async_trait]
impl StreamingExecutor for CountingStreamTool {
    async fn execute_stream(
        &self,
        params: Value,
        scope: &ExecutionScope,
    ) -> anyhow::Result<mpsc::Receiver<StreamChunk>> {
        let count = params["count"].as_u64().unwrap_or(0);
        let (ctx, rx) = StreamingContext::new(scope.token());
        tokio::spawn(async move {
            for i in 0..count {
                if ctx.send(json!(format!("chunk {i}"))).await.is_err() {
                    return;
                }
            }
            let _ = ctx.complete().await;
            ctx.close().await;
        });
        Ok(rx)
    }
}

fn streaming_engine() -> ExecutionEngine {
    common::init_tracing();
    let registry = Arc::new(ToolRegistry::new());
    registry
        .register(Tool::new(
            "counter",
            "counter",
            "Streams numbered chunks",
            "1.0.0",
            ToolSchema::object().with_property("count", PropertySchema::integer()),
            Arc::new(CountingStreamTool),
        ))
        .unwrap();
    ExecutionEngine::new(registry)
}

async fn collect(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    chunks
}

#[tokio::test]
async fn streaming_count_scenario() {
    let engine = streaming_engine();
    let rx = engine
        .execute_stream("counter", json!({"count": 3}))
        .await
        .unwrap();
    let chunks = collect(rx).await;

    assert_eq!(chunks.len(), 4);
    let types: Vec<ChunkType> = chunks.iter().map(|c| c.chunk_type).collect();
    assert_eq!(
        types,
        vec![
            ChunkType::Data,
            ChunkType::Data,
            ChunkType::Data,
            ChunkType::Complete,
        ]
    );
    let indices: Vec<u64> = chunks.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(chunks[0].data, json!("chunk 0"));
    assert_eq!(chunks[1].data, json!("chunk 1"));
    assert_eq!(chunks[2].data, json!("chunk 2"));
}

#[tokio::test]
async fn engine_stream_feeds_the_accumulator() {
    let engine = streaming_engine();
    let mut rx = engine
        .execute_stream("counter", json!({"count": 2}))
        .await
        .unwrap();

    let acc = StreamAccumulator::new();
    while let Some(chunk) = rx.recv().await {
        acc.add_chunk(&chunk).unwrap();
    }
    let (data, metadata) = acc.result().unwrap();
    assert_eq!(data, "chunk 0chunk 1");
    assert!(metadata.is_empty());
}

#[tokio::test]
async fn stream_json_round_trips_through_accumulator() {
    common::init_tracing();
    let token = CancellationToken::new();
    let original = json!({"name": "tooldock", "items": [1, 2, 3]});

    let mut rx = StreamingToolHelper::stream_json(&token, &original, 7).unwrap();
    let acc = StreamAccumulator::new();
    while let Some(chunk) = rx.recv().await {
        acc.add_chunk(&chunk).unwrap();
    }

    let (data, _) = acc.result().unwrap();
    let parsed: Value = serde_json::from_str(&data).unwrap();
    assert_eq!(parsed, original);
}

#[tokio::test]
async fn bad_chunk_sizes_fail_before_spawning() {
    common::init_tracing();
    let token = CancellationToken::new();
    let value = json!("x");

    assert!(matches!(
        StreamingToolHelper::stream_json(&token, &value, 0),
        Err(StreamError::InvalidChunkSize { .. })
    ));
    assert!(matches!(
        StreamingToolHelper::stream_reader(&token, std::io::Cursor::new(vec![]), 0),
        Err(StreamError::InvalidChunkSize { .. })
    ));
    assert!(matches!(
        StreamingToolHelper::stream_json(&token, &value, 10 * 1024 * 1024 + 1),
        Err(StreamError::InvalidChunkSize { .. })
    ));
}

#[tokio::test]
async fn empty_reader_emits_a_single_complete_chunk() {
    common::init_tracing();
    let token = CancellationToken::new();
    let rx = StreamingToolHelper::stream_reader(&token, std::io::Cursor::new(vec![]), 16)
        .unwrap();
    let chunks = collect(rx).await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk_type, ChunkType::Complete);
}

#[tokio::test]
async fn error_chunks_poison_the_accumulated_result() {
    common::init_tracing();
    let token = CancellationToken::new();
    let (ctx, mut rx) = StreamingContext::new(&token);

    tokio::spawn(async move {
        let _ = ctx.send(json!("partial")).await;
        let _ = ctx.send_error("upstream died").await;
        ctx.close().await;
    });

    let acc = StreamAccumulator::new();
    while let Some(chunk) = rx.recv().await {
        acc.add_chunk(&chunk).unwrap();
    }
    assert!(acc.has_error());
    let err = acc.result().unwrap_err();
    assert_eq!(err, StreamError::Failed("upstream died".to_string()));
}
