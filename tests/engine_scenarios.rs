//! End-to-end tests of the conversion engine.
//!
//! These drive the public API with an in-memory codec so that large canvases
//! and injected codec failures stay fast and deterministic.

mod common;

use common::{engine, engine_with_config, solid, FastCodec, FlakyCodec, SlowCodec};
use imgconv_engine::config::EngineConfig;
use imgconv_engine::recovery::Category;
use imgconv_engine::router::FormatGraph;
use imgconv_engine::{ConversionOptions, ConversionRequest, ErrorKind, Format};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn raw_request(width: u32, height: u32, from: Format, to: Format) -> ConversionRequest {
    ConversionRequest::new(
        FastCodec::encode_raw(&solid(width, height)),
        from,
        to,
        ConversionOptions::default(),
    )
}

fn sized(mut request: ConversionRequest, width: u32, height: u32) -> ConversionRequest {
    request.options.target_width = Some(width);
    request.options.target_height = Some(height);
    request
}

#[test]
fn test_direct_route() {
    let engine = engine(Arc::new(FastCodec));
    let route = engine.route(Format::Svg, Format::Png).unwrap();
    assert_eq!(route.formats(), &[Format::Svg, Format::Png]);
}

#[tokio::test]
async fn test_hub_route_through_png() {
    let mut engine = engine(Arc::new(FastCodec));
    let route = engine.route(Format::Jpeg, Format::Webp).unwrap();
    assert_eq!(route.formats(), &[Format::Jpeg, Format::Png, Format::Webp]);

    let result = engine
        .convert(raw_request(30, 20, Format::Jpeg, Format::Webp))
        .await
        .unwrap();
    assert_eq!(result.route, vec![Format::Jpeg, Format::Png, Format::Webp]);
    assert_eq!(result.metadata.format, Format::Webp);
    assert_eq!((result.metadata.width, result.metadata.height), (30, 20));
}

#[tokio::test]
async fn test_large_input_is_tiled_to_exact_size() {
    let mut engine = engine(Arc::new(FastCodec));
    let ticks = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&ticks);
    engine.set_progress(Some(Arc::new(move |_, total| {
        assert_eq!(total, 9);
        seen.fetch_add(1, Ordering::SeqCst);
    })));

    let mut request = sized(raw_request(100, 100, Format::Png, Format::Jpeg), 3000, 3000);
    request.options.size_hint_bytes = Some(6 * 1024 * 1024);

    let result = engine.convert(request).await.unwrap();

    assert_eq!((result.metadata.width, result.metadata.height), (3000, 3000));
    assert_eq!(ticks.load(Ordering::SeqCst), 9);
    let decoded = FastCodec::decode_raw(&result.encoded_bytes).unwrap();
    assert_eq!(decoded.dimensions(), (3000, 3000));
    assert_eq!(decoded.get_pixel(2999, 2999), solid(1, 1).get_pixel(0, 0));
}

#[tokio::test]
async fn test_timeout_retries_once_with_smaller_output() {
    let codec = Arc::new(FlakyCodec::new("operation timed out", 2));
    let mut engine = engine(codec.clone());
    let request = sized(raw_request(10, 10, Format::Svg, Format::Png), 1000, 1000);

    let record = engine.convert(request).await.unwrap_err();

    assert_eq!(codec.encodes(), vec![(1000, 1000, 90), (700, 700, 80)]);
    assert_eq!(record.kind, ErrorKind::TimeoutError);
    assert_eq!(record.category, Category::System);
    assert!(record.recovery_attempted);
    assert!(!record.recovered);
    assert_eq!(engine.stats().recovered_errors, 0);
}

fn short_deadline() -> EngineConfig {
    EngineConfig {
        timeout_ms: 50,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn test_route_past_deadline_retries_smaller() {
    let codec = Arc::new(SlowCodec::new(Duration::from_millis(250), 1));
    let mut engine = engine_with_config(codec.clone(), short_deadline());

    let result = engine
        .convert(raw_request(20, 20, Format::Png, Format::Gif))
        .await
        .unwrap();

    assert!(result.recovered);
    assert_eq!((result.metadata.width, result.metadata.height), (14, 14));
    assert_eq!(codec.encodes(), vec![(20, 20), (14, 14)]);
    let record = engine.recent_errors(1)[0];
    assert_eq!(record.kind, ErrorKind::TimeoutError);
    assert!(record.recovered);
}

#[tokio::test]
async fn test_route_past_deadline_twice_surfaces_timeout() {
    let codec = Arc::new(SlowCodec::new(Duration::from_millis(250), 2));
    let mut engine = engine_with_config(codec.clone(), short_deadline());

    let record = engine
        .convert(raw_request(20, 20, Format::Png, Format::Gif))
        .await
        .unwrap_err();

    assert_eq!(record.kind, ErrorKind::TimeoutError);
    assert!(record.message.contains("timed out"));
    assert!(record.recovery_attempted);
    assert!(!record.recovered);
    assert_eq!(codec.encodes(), vec![(20, 20), (14, 14)]);
}

#[tokio::test]
async fn test_out_of_memory_is_system_memory_error() {
    let codec = Arc::new(FlakyCodec::new("out of memory", 2));
    let mut engine = engine(codec.clone());

    let record = engine
        .convert(raw_request(16, 16, Format::Png, Format::Gif))
        .await
        .unwrap_err();

    assert_eq!(record.category, Category::System);
    assert_eq!(record.kind, ErrorKind::MemoryError);
    assert!(record.recovery_attempted);
    // Memory recovery retries with the same options.
    assert_eq!(codec.encodes(), vec![(16, 16, 90), (16, 16, 90)]);
}

#[tokio::test]
async fn test_memory_error_recovers_on_retry() {
    let codec = Arc::new(FlakyCodec::new("allocation failed", 1));
    let mut engine = engine(codec);

    let result = engine
        .convert(raw_request(16, 16, Format::Png, Format::Gif))
        .await
        .unwrap();

    assert!(result.recovered);
    let stats = engine.stats();
    assert_eq!(stats.total_errors, 1);
    assert_eq!(stats.recovered_errors, 1);
    assert_eq!(stats.recovery_rate(), 1.0);
    assert!(engine.recent_errors(1)[0].recovered);
}

#[tokio::test]
async fn test_oversized_output_is_clamped_and_recovered() {
    let config = EngineConfig {
        max_dimension: 500,
        ..EngineConfig::default()
    };
    let mut engine = engine_with_config(Arc::new(FastCodec), config);
    let mut request = sized(raw_request(20, 10, Format::Png, Format::Webp), 800, 400);
    request.options.maintain_aspect_ratio = false;

    let result = engine.convert(request).await.unwrap();

    assert!(result.recovered);
    assert_eq!((result.metadata.width, result.metadata.height), (500, 250));
    assert_eq!(engine.recent_errors(1)[0].kind, ErrorKind::SizeError);
}

#[tokio::test]
async fn test_manual_retry_after_unrecovered_failure() {
    let codec = Arc::new(FlakyCodec::new("operation timed out", 2));
    let mut engine = engine(codec);
    let request = raw_request(12, 12, Format::Png, Format::Jpeg);

    let record = engine.convert(request.clone()).await.unwrap_err();
    let result = engine.retry(&record, request).await.unwrap();

    assert!(result.recovered);
    let stored = engine.recent_errors(1)[0];
    assert_eq!(stored.id, record.id);
    assert!(stored.recovered);
    assert_eq!(engine.recovery().attempts(&record.id), 2);
}

#[tokio::test]
async fn test_attempt_cap_counts_manual_retries() {
    let codec = Arc::new(FlakyCodec::new("operation timed out", 100));
    let mut engine = engine(codec.clone());
    let request = raw_request(12, 12, Format::Png, Format::Jpeg);

    let record = engine.convert(request.clone()).await.unwrap_err();
    assert!(engine.retry(&record, request.clone()).await.is_err());
    assert!(engine.retry(&record, request.clone()).await.is_err());
    assert_eq!(codec.encodes().len(), 4);

    let refused = engine.retry(&record, request).await.unwrap_err();
    assert_eq!(refused.id, record.id);
    assert_eq!(codec.encodes().len(), 4);
    assert_eq!(engine.recovery().attempts(&record.id), 3);
}

#[tokio::test]
async fn test_validation_errors_are_recorded_without_retry() {
    let mut engine = engine(Arc::new(FastCodec));
    let mut request = raw_request(4, 4, Format::Png, Format::Jpeg);
    request.options.target_width = Some(0);

    let record = engine.convert(request).await.unwrap_err();

    assert_eq!(record.kind, ErrorKind::InvalidOptions);
    assert!(!record.retryable);
    assert!(!record.recovery_attempted);
    assert_eq!(engine.stats().by_kind.get(&ErrorKind::InvalidOptions), Some(&1));
}

#[tokio::test]
async fn test_unreachable_target_is_unsupported_route() {
    let mut engine = engine(Arc::new(FastCodec))
        .with_graph(FormatGraph::new([(Format::Png, Format::Jpeg)]));

    let record = engine
        .convert(raw_request(4, 4, Format::Jpeg, Format::Png))
        .await
        .unwrap_err();

    assert_eq!(record.kind, ErrorKind::UnsupportedRoute);
    assert_eq!(record.category, Category::Conversion);
    assert_eq!(record.context.from, Some(Format::Jpeg));
}

#[tokio::test]
async fn test_history_access_and_clear() {
    let mut engine = engine(Arc::new(FastCodec));
    for quality in [1u8, 2, 3] {
        let mut request = raw_request(4, 4, Format::Png, Format::Jpeg);
        request.options.quality = quality;
        let _ = engine.convert(request).await;
    }

    assert_eq!(engine.recent_errors(10).len(), 3);
    assert_eq!(engine.recent_errors(2).len(), 2);

    engine.clear_history();
    assert!(engine.recent_errors(10).is_empty());
    assert_eq!(engine.stats().total_errors, 3);
}

#[tokio::test]
async fn test_progress_reports_single_pass() {
    let mut engine = engine(Arc::new(FastCodec));
    let calls = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);
    engine.set_progress(Some(Arc::new(move |i, n| sink.lock().unwrap().push((i, n)))));

    engine
        .convert(raw_request(8, 8, Format::Svg, Format::Png))
        .await
        .unwrap();

    assert_eq!(*calls.lock().unwrap(), vec![(1, 1)]);
}
