use super::*;
use serde_json::json;

async fn collect(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    chunks
}

#[test]
fn chunk_serde_shape() {
    let chunk = StreamChunk::new(ChunkType::Data, json!("payload"), 3);
    let value = serde_json::to_value(&chunk).unwrap();
    assert_eq!(value["type"], "data");
    assert_eq!(value["data"], "payload");
    assert_eq!(value["index"], 3);
    assert!(value["timestamp"].is_string());

    let back: StreamChunk = serde_json::from_value(value).unwrap();
    assert_eq!(back, chunk);
}

#[test]
fn complete_chunk_omits_null_data() {
    let chunk = StreamChunk::new(ChunkType::Complete, Value::Null, 9);
    let value = serde_json::to_value(&chunk).unwrap();
    assert!(value.get("data").is_none());
    assert!(chunk.is_terminal());
}

#[tokio::test]
async fn context_assigns_monotonic_indices() {
    let token = CancellationToken::new();
    let (ctx, rx) = StreamingContext::new(&token);

    ctx.send(json!("a")).await.unwrap();
    ctx.send_metadata(HashMap::from([("k".to_string(), json!(1))]))
        .await
        .unwrap();
    ctx.send(json!("b")).await.unwrap();
    ctx.complete().await.unwrap();
    ctx.close().await;

    let chunks = collect(rx).await;
    let indices: Vec<u64> = chunks.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(chunks[1].chunk_type, ChunkType::Metadata);
    assert_eq!(chunks[3].chunk_type, ChunkType::Complete);
}

#[tokio::test]
async fn context_send_after_close_fails() {
    let token = CancellationToken::new();
    let (ctx, _rx) = StreamingContext::new(&token);
    ctx.close().await;
    ctx.close().await; // idempotent
    let err = ctx.send(json!("late")).await.unwrap_err();
    assert_eq!(err, StreamError::ContextClosed);
    assert_eq!(err.to_string(), "streaming context is closed");
}

#[tokio::test]
async fn context_send_aborts_on_cancellation() {
    let token = CancellationToken::new();
    // Capacity of one: the second send blocks until cancelled.
    let (ctx, _rx) = StreamingContext::with_capacity(&token, 1);
    ctx.send(json!("fills the buffer")).await.unwrap();

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let err = ctx.send(json!("blocked")).await.unwrap_err();
    assert_eq!(err, StreamError::Canceled);
}

#[tokio::test]
async fn context_error_chunk_carries_message() {
    let token = CancellationToken::new();
    let (ctx, rx) = StreamingContext::new(&token);
    ctx.send_error("backend exploded").await.unwrap();
    ctx.close().await;

    let chunks = collect(rx).await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk_type, ChunkType::Error);
    assert_eq!(chunks[0].data, json!("backend exploded"));
}

#[tokio::test]
async fn stream_json_splits_at_byte_boundaries() {
    let token = CancellationToken::new();
    let value = json!({"message": "hello world"});
    let serialized = serde_json::to_string(&value).unwrap();

    let rx = StreamingToolHelper::stream_json(&token, &value, 5).unwrap();
    let chunks = collect(rx).await;

    let data: String = chunks
        .iter()
        .filter(|c| c.chunk_type == ChunkType::Data)
        .map(|c| c.data.as_str().unwrap())
        .collect();
    assert_eq!(data, serialized);
    // Every data chunk is at most five bytes.
    for c in chunks.iter().filter(|c| c.chunk_type == ChunkType::Data) {
        assert!(c.data.as_str().unwrap().len() <= 5);
    }
    assert_eq!(chunks.last().unwrap().chunk_type, ChunkType::Complete);
    let indices: Vec<u64> = chunks.iter().map(|c| c.index).collect();
    assert_eq!(indices, (0..chunks.len() as u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn stream_json_rejects_bad_chunk_sizes() {
    let token = CancellationToken::new();
    let value = json!("x");
    assert!(matches!(
        StreamingToolHelper::stream_json(&token, &value, 0),
        Err(StreamError::InvalidChunkSize { .. })
    ));
    assert!(matches!(
        StreamingToolHelper::stream_json(&token, &value, MAX_CHUNK_SIZE + 1),
        Err(StreamError::InvalidChunkSize { .. })
    ));
}

#[tokio::test]
async fn stream_json_cancellation_closes_channel() {
    let token = CancellationToken::new();
    token.cancel();
    let value = json!({"k": "v"});
    let mut rx = StreamingToolHelper::stream_json(&token, &value, 1).unwrap();
    // The producer exits promptly; the channel drains to a close without a
    // complete chunk necessarily arriving.
    let mut saw_complete = false;
    while let Some(chunk) = rx.recv().await {
        saw_complete |= chunk.chunk_type == ChunkType::Complete;
    }
    assert!(!saw_complete);
}

#[tokio::test]
async fn stream_reader_empty_input_emits_only_complete() {
    let token = CancellationToken::new();
    let rx = StreamingToolHelper::stream_reader(&token, std::io::Cursor::new(vec![]), 8)
        .unwrap();
    let chunks = collect(rx).await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk_type, ChunkType::Complete);
    assert_eq!(chunks[0].index, 0);
}

#[tokio::test]
async fn stream_reader_chunks_then_complete() {
    let token = CancellationToken::new();
    let payload = b"abcdefghij".to_vec();
    let rx =
        StreamingToolHelper::stream_reader(&token, std::io::Cursor::new(payload), 4).unwrap();
    let chunks = collect(rx).await;

    let data: String = chunks
        .iter()
        .filter(|c| c.chunk_type == ChunkType::Data)
        .map(|c| c.data.as_str().unwrap())
        .collect();
    assert_eq!(data, "abcdefghij");
    assert_eq!(chunks.last().unwrap().chunk_type, ChunkType::Complete);
}

#[tokio::test]
async fn stream_reader_propagates_read_errors_as_error_chunks() {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("disk on fire")))
        }
    }

    let token = CancellationToken::new();
    let rx = StreamingToolHelper::stream_reader(&token, FailingReader, 8).unwrap();
    let chunks = collect(rx).await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk_type, ChunkType::Error);
    assert!(chunks[0].data.as_str().unwrap().contains("disk on fire"));
}

fn data_chunk(s: &str, index: u64) -> StreamChunk {
    StreamChunk::new(ChunkType::Data, json!(s), index)
}

#[test]
fn accumulator_concatenates_data_in_order() {
    let acc = StreamAccumulator::new();
    acc.add_chunk(&data_chunk("hello ", 0)).unwrap();
    acc.add_chunk(&data_chunk("world", 1)).unwrap();
    acc.add_chunk(&StreamChunk::new(ChunkType::Complete, Value::Null, 2))
        .unwrap();

    let (data, metadata) = acc.result().unwrap();
    assert_eq!(data, "hello world");
    assert!(metadata.is_empty());
}

#[test]
fn accumulator_rejects_non_string_data() {
    let acc = StreamAccumulator::new();
    let err = acc
        .add_chunk(&StreamChunk::new(ChunkType::Data, json!(42), 0))
        .unwrap_err();
    assert_eq!(err, StreamError::NonStringData);
}

#[test]
fn accumulator_metadata_merge_overwrites() {
    let acc = StreamAccumulator::new();
    acc.add_chunk(&StreamChunk::new(
        ChunkType::Metadata,
        json!({"a": 1, "b": 1}),
        0,
    ))
    .unwrap();
    acc.add_chunk(&StreamChunk::new(ChunkType::Metadata, json!({"b": 2}), 1))
        .unwrap();
    // Non-mapping metadata payloads are tolerated.
    acc.add_chunk(&StreamChunk::new(ChunkType::Metadata, json!("loose"), 2))
        .unwrap();
    acc.add_chunk(&StreamChunk::new(ChunkType::Complete, Value::Null, 3))
        .unwrap();

    let (_, metadata) = acc.result().unwrap();
    assert_eq!(metadata["a"], json!(1));
    assert_eq!(metadata["b"], json!(2));
}

#[test]
fn accumulator_error_chunk_sets_flag_and_message() {
    let acc = StreamAccumulator::new();
    acc.add_chunk(&StreamChunk::new(
        ChunkType::Error,
        json!("upstream broke"),
        0,
    ))
    .unwrap();
    assert!(acc.has_error());
    let err = acc.result().unwrap_err();
    assert_eq!(err, StreamError::Failed("upstream broke".to_string()));
}

#[test]
fn accumulator_error_with_non_string_payload_still_flags() {
    let acc = StreamAccumulator::new();
    acc.add_chunk(&StreamChunk::new(ChunkType::Error, json!(500), 0))
        .unwrap();
    assert!(acc.has_error());
    assert_eq!(
        acc.result().unwrap_err(),
        StreamError::Failed("unknown stream error".to_string())
    );
}

#[test]
fn accumulator_incomplete_stream_errors() {
    let acc = StreamAccumulator::new();
    acc.add_chunk(&data_chunk("partial", 0)).unwrap();
    assert_eq!(acc.result().unwrap_err(), StreamError::NotComplete);
}

#[test]
fn accumulator_rejects_after_complete() {
    let acc = StreamAccumulator::new();
    acc.add_chunk(&StreamChunk::new(ChunkType::Complete, Value::Null, 0))
        .unwrap();
    let err = acc.add_chunk(&data_chunk("late", 1)).unwrap_err();
    assert_eq!(err, StreamError::AlreadyCompleted);
}

#[test]
fn accumulator_bounds_reject_without_mutation() {
    let acc = StreamAccumulator::with_limits(AccumulatorLimits {
        max_chunks: 2,
        max_total_size: 8,
        max_chunk_size: 6,
    });

    acc.add_chunk(&data_chunk("abc", 0)).unwrap();

    // Single-chunk bound.
    let err = acc.add_chunk(&data_chunk("toolong", 1)).unwrap_err();
    assert!(matches!(err, StreamError::ChunkTooLarge { size: 7, .. }));
    assert_eq!(acc.chunk_count(), 1);

    // Total-size bound: six more bytes would push the total to nine.
    let err = acc.add_chunk(&data_chunk("defghi", 1)).unwrap_err();
    assert!(matches!(err, StreamError::StreamTooLarge { .. }));
    assert_eq!(acc.chunk_count(), 1);

    acc.add_chunk(&data_chunk("def", 1)).unwrap();

    // Chunk-count bound.
    let err = acc.add_chunk(&data_chunk("x", 2)).unwrap_err();
    assert!(matches!(err, StreamError::TooManyChunks { limit: 2 }));
    assert_eq!(acc.chunk_count(), 2);

    // The accepted prefix is intact.
    acc.add_chunk(&StreamChunk::new(ChunkType::Complete, Value::Null, 3))
        .unwrap();
    let (data, _) = acc.result().unwrap();
    assert_eq!(data, "abcdef");
}

fn parser_schema() -> ToolSchema {
    use crate::schema::PropertySchema;
    ToolSchema::object()
        .with_property("count", PropertySchema::integer())
        .with_required(&["count"])
}

#[test]
fn parser_waits_for_complete_json() {
    let mut parser = StreamingParameterParser::new(parser_schema());
    parser.add_chunk("{\"count\"").unwrap();
    assert!(parser.try_parse().unwrap().is_none());
    assert!(!parser.is_complete());

    parser.add_chunk(": 3}").unwrap();
    let value = parser.try_parse().unwrap().unwrap();
    assert_eq!(value["count"], 3);
    assert!(parser.is_complete());
}

#[test]
fn parser_validation_failure_keeps_accepting() {
    let mut parser = StreamingParameterParser::new(parser_schema());
    parser.add_chunk("{\"count\": \"three\"}").unwrap();
    let violation = parser.try_parse().unwrap_err();
    assert_eq!(violation.path, "count");
    assert!(!parser.is_complete());
    // Still accepting input after a validation failure.
    parser.add_chunk(" ").unwrap();
}

#[test]
fn parser_enforces_buffer_bound() {
    let mut parser =
        StreamingParameterParser::new(parser_schema()).with_buffer_limit(8);
    parser.add_chunk("{\"a\"").unwrap();
    let err = parser.add_chunk(": 12345}").unwrap_err();
    assert!(matches!(err, StreamError::StreamTooLarge { .. }));
    assert_eq!(parser.buffered_len(), 4);
}

#[test]
fn parser_rejects_input_after_completion() {
    let mut parser = StreamingParameterParser::new(parser_schema());
    parser.add_chunk("{\"count\": 1}").unwrap();
    parser.try_parse().unwrap().unwrap();
    assert_eq!(
        parser.add_chunk("more").unwrap_err(),
        StreamError::AlreadyCompleted
    );
}

#[tokio::test]
async fn builder_progress_and_complete_sequence() {
    let token = CancellationToken::new();
    let (builder, rx) = StreamingResultBuilder::new(&token);

    builder.send_progress(1, 2, "halfway").await.unwrap();
    builder.send_partial_result(json!("part")).await.unwrap();
    builder.complete(Some(json!("final"))).await.unwrap();

    let chunks = collect(rx).await;
    assert_eq!(chunks.len(), 4);
    assert_eq!(chunks[0].chunk_type, ChunkType::Metadata);
    assert_eq!(chunks[0].data["progress"]["current"], 1);
    assert_eq!(chunks[0].data["progress"]["message"], "halfway");
    assert_eq!(chunks[1].data, json!("part"));
    assert_eq!(chunks[2].data, json!("final"));
    assert_eq!(chunks[3].chunk_type, ChunkType::Complete);
}

#[tokio::test]
async fn builder_error_closes_stream() {
    let token = CancellationToken::new();
    let (builder, rx) = StreamingResultBuilder::new(&token);
    builder.error("stream failed").await.unwrap();

    let chunks = collect(rx).await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk_type, ChunkType::Error);

    // Further sends fail; close stays idempotent.
    assert!(builder.send_partial_result(json!("x")).await.is_err());
    builder.close().await;
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn accumulator_accepts_any_bounded_data(pieces in proptest::collection::vec(".{0,32}", 0..20)) {
            let acc = StreamAccumulator::new();
            for (i, piece) in pieces.iter().enumerate() {
                acc.add_chunk(&data_chunk(piece, i as u64)).unwrap();
            }
            acc.add_chunk(&StreamChunk::new(ChunkType::Complete, Value::Null, pieces.len() as u64)).unwrap();
            let (data, _) = acc.result().unwrap();
            prop_assert_eq!(data, pieces.concat());
        }

        #[test]
        fn context_indices_have_no_gaps(count in 1usize..40) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async move {
                let token = CancellationToken::new();
                let (ctx, rx) = StreamingContext::with_capacity(&token, 64);
                for i in 0..count {
                    ctx.send(json!(format!("chunk {i}"))).await.unwrap();
                }
                ctx.complete().await.unwrap();
                ctx.close().await;
                let chunks = collect(rx).await;
                let indices: Vec<u64> = chunks.iter().map(|c| c.index).collect();
                let expected: Vec<u64> = (0..=count as u64).collect();
                assert_eq!(indices, expected);
            });
        }
    }
}
