//! Range Cache Reader against complete cache entries

use bytes::Bytes;
use futures::TryStreamExt;
use http::header;
use http::StatusCode;
use preview_cache::{CacheLayout, CachePaths, ProxyError, ProxyMetrics, ProxyResponse, RangeCacheReader};
use std::path::Path;
use std::sync::Arc;

const CHUNK: usize = 512 * 1024;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

async fn complete_entry(dir: &Path, url: &str, data: &[u8]) -> CachePaths {
    let paths = CacheLayout::new(dir).resolve(url);
    tokio::fs::write(&paths.data, data).await.unwrap();
    paths.write_marker(data.len() as u64).await.unwrap();
    paths
}

async fn body_of(response: ProxyResponse) -> Vec<u8> {
    let chunks: Vec<Bytes> = response.body.try_collect().await.unwrap();
    chunks.concat()
}

fn reader() -> RangeCacheReader {
    RangeCacheReader::new(CHUNK, Arc::new(ProxyMetrics::new()))
}

#[tokio::test]
async fn test_single_byte_range() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let paths = complete_entry(dir.path(), "https://cdn.example.com/a.mp4", &data).await;

    let response = reader().read(&paths, "video", Some("bytes=10-10")).await.unwrap();
    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers[header::CONTENT_RANGE], "bytes 10-10/1000");
    assert_eq!(response.headers[header::CONTENT_LENGTH], "1");
    assert_eq!(body_of(response).await, vec![data[10]]);
}

#[tokio::test]
async fn test_open_ended_range() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let paths = complete_entry(dir.path(), "https://cdn.example.com/a.mp4", &data).await;

    let response = reader().read(&paths, "video", Some("bytes=990-")).await.unwrap();
    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers[header::CONTENT_RANGE], "bytes 990-999/1000");
    assert_eq!(response.headers[header::CONTENT_LENGTH], "10");
    assert_eq!(body_of(response).await, &data[990..]);
}

#[tokio::test]
async fn test_malformed_range_falls_back_to_full_file() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let paths = complete_entry(dir.path(), "https://cdn.example.com/a.mp4", &data).await;

    let response = reader().read(&paths, "video", Some("bytes=abc")).await.unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers[header::CONTENT_LENGTH], "1000");
    assert!(response.headers.get(header::CONTENT_RANGE).is_none());
    assert_eq!(body_of(response).await, data);
}

#[tokio::test]
async fn test_mid_file_range_on_large_entry() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(100_000);
    let paths = complete_entry(dir.path(), "https://cdn.example.com/v.mp4", &data).await;

    let response = reader()
        .read(&paths, "video", Some("bytes=50000-59999"))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers[header::CONTENT_RANGE], "bytes 50000-59999/100000");
    assert_eq!(response.headers[header::CONTENT_LENGTH], "10000");

    let body = body_of(response).await;
    assert_eq!(body.len(), 10_000);
    assert_eq!(body, &data[50_000..60_000]);
}

#[tokio::test]
async fn test_full_range_equals_no_range_equals_payload() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(3 * CHUNK + 17);
    let paths = complete_entry(dir.path(), "https://cdn.example.com/big.mp4", &data).await;

    let whole = format!("bytes=0-{}", data.len() - 1);
    let ranged = body_of(reader().read(&paths, "video", Some(&whole)).await.unwrap()).await;
    let plain = body_of(reader().read(&paths, "video", None).await.unwrap()).await;

    assert_eq!(ranged, plain);
    assert_eq!(plain, data);
}

#[tokio::test]
async fn test_headers_name_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let paths = complete_entry(dir.path(), "https://cdn.example.com/a.mp4", &payload(10)).await;

    let response = reader().read(&paths, "Summer Trip", None).await.unwrap();
    assert_eq!(response.headers[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(response.headers[header::ACCEPT_RANGES], "bytes");
    assert_eq!(
        response.headers[header::CONTENT_DISPOSITION],
        "inline; filename=\"Summer%20Trip.mp4\""
    );
}

#[tokio::test]
async fn test_range_past_end_is_unsatisfiable() {
    let dir = tempfile::tempdir().unwrap();
    let paths = complete_entry(dir.path(), "https://cdn.example.com/a.mp4", &payload(1000)).await;

    let result = reader().read(&paths, "video", Some("bytes=5000-6000")).await;
    assert!(matches!(
        result,
        Err(ProxyError::RangeNotSatisfiable {
            start: 5000,
            size: 1000
        })
    ));
}

#[tokio::test]
async fn test_reader_counts_cache_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let paths = complete_entry(dir.path(), "https://cdn.example.com/a.mp4", &payload(1000)).await;
    let metrics = Arc::new(ProxyMetrics::new());
    let reader = RangeCacheReader::new(CHUNK, metrics.clone());

    let response = reader.read(&paths, "video", Some("bytes=100-199")).await.unwrap();
    body_of(response).await;

    assert_eq!(metrics.get_stats().bytes_from_cache, 100);
}
