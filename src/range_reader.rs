//! Range Cache Reader: byte-exact responses from complete cache entries

use crate::cache_key::CachePaths;
use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;
use crate::models::{
    content_disposition, ByteRange, ByteStream, ProxyResponse, RangeRequest, DEFAULT_CONTENT_TYPE,
};
use bytes::Bytes;
use futures::{stream, StreamExt};
use http::header::{self, HeaderMap, HeaderValue};
use http::StatusCode;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

/// Serves complete cache entries, honoring single byte ranges
pub struct RangeCacheReader {
    chunk_size: usize,
    metrics: Arc<ProxyMetrics>,
}

impl RangeCacheReader {
    /// # Arguments
    /// * `chunk_size` - Upper bound on each emitted chunk
    /// * `metrics` - Shared metrics collector
    pub fn new(chunk_size: usize, metrics: Arc<ProxyMetrics>) -> Self {
        RangeCacheReader {
            chunk_size,
            metrics,
        }
    }

    /// Build response headers for a cached entry
    ///
    /// # Arguments
    /// * `total` - Size of the cached resource in bytes
    /// * `range` - Resolved range, `None` for a full response
    /// * `title` - Display title used for the served filename
    pub fn build_response_header(
        &self,
        total: u64,
        range: Option<ByteRange>,
        title: &str,
    ) -> (StatusCode, HeaderMap) {
        let mut headers = HeaderMap::new();

        let status = match range {
            Some(range) => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(range.size()));
                // Only digits, spaces, '-' and '/'
                if let Ok(value) = HeaderValue::from_str(&range.content_range(total)) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                StatusCode::PARTIAL_CONTENT
            }
            None => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(total));
                StatusCode::OK
            }
        };

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
        headers.insert(header::CONTENT_DISPOSITION, content_disposition(title));
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

        debug!(
            "Built cache response headers: status={}, total={}, range={:?}",
            status, total, range
        );
        (status, headers)
    }

    /// Serve a complete entry
    ///
    /// A missing or malformed `range_header` produces the whole file with
    /// status 200; any well-formed range produces a 206, even one covering the
    /// whole file.
    ///
    /// # Returns
    /// * `Err(ProxyError::RangeNotSatisfiable)` if the range starts past the end
    /// * `Err(ProxyError::TruncatedCache)` if the data file is shorter than the
    ///   length recorded in the completion marker
    pub async fn read(
        &self,
        paths: &CachePaths,
        title: &str,
        range_header: Option<&str>,
    ) -> Result<ProxyResponse> {
        let mut file = File::open(&paths.data).await?;
        let on_disk = file.metadata().await?.len();
        let total = paths.recorded_length().await.unwrap_or(on_disk);
        if on_disk < total {
            warn!(
                "Cache file key={} holds {} bytes but marker records {}",
                paths.key, on_disk, total
            );
            return Err(ProxyError::TruncatedCache {
                expected: total,
                actual: on_disk,
            });
        }

        let range = match range_header.map(RangeRequest::parse) {
            None => None,
            Some(RangeRequest::Malformed) => {
                debug!(
                    "Malformed range header {:?} for key={}, serving full file",
                    range_header, paths.key
                );
                None
            }
            Some(RangeRequest::Range(spec)) => Some(spec.resolve(total)?),
        };

        let (status, headers) = self.build_response_header(total, range, title);
        let (start, length) = match range {
            Some(range) => (range.start, range.size()),
            None => (0, total),
        };

        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }

        Ok(ProxyResponse {
            status,
            headers,
            body: self.file_chunks(file, start, length),
        })
    }

    /// Lazily read `length` bytes starting at `start` from an already positioned file
    fn file_chunks(&self, file: File, start: u64, length: u64) -> ByteStream {
        struct State {
            file: File,
            emitted: u64,
        }

        let chunk_size = self.chunk_size as u64;
        let metrics = self.metrics.clone();

        stream::try_unfold(State { file, emitted: 0 }, move |mut st| {
            let metrics = metrics.clone();
            async move {
                let remaining = length - st.emitted;
                if remaining == 0 {
                    return Ok(None);
                }

                let mut buf = vec![0u8; remaining.min(chunk_size) as usize];
                let n = st.file.read(&mut buf).await?;
                if n == 0 {
                    return Err(ProxyError::TruncatedCache {
                        expected: start + length,
                        actual: start + st.emitted,
                    });
                }
                buf.truncate(n);
                st.emitted += n as u64;
                metrics.record_bytes_from_cache(n as u64);

                Ok(Some((Bytes::from(buf), st)))
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::CacheLayout;
    use futures::TryStreamExt;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    async fn complete_entry(dir: &std::path::Path, data: &[u8]) -> CachePaths {
        let paths = CacheLayout::new(dir).resolve("https://cdn.example.com/cached.mp4");
        tokio::fs::write(&paths.data, data).await.unwrap();
        paths.write_marker(data.len() as u64).await.unwrap();
        paths
    }

    fn reader(chunk_size: usize) -> RangeCacheReader {
        RangeCacheReader::new(chunk_size, Arc::new(ProxyMetrics::new()))
    }

    async fn body_of(response: ProxyResponse) -> Result<Vec<u8>> {
        let chunks: Vec<Bytes> = response.body.try_collect().await?;
        Ok(chunks.concat())
    }

    #[tokio::test]
    async fn test_full_file_without_range() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(1000);
        let paths = complete_entry(dir.path(), &data).await;

        let response = reader(64).read(&paths, "video", None).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers[header::CONTENT_LENGTH], "1000");
        assert_eq!(response.headers[header::ACCEPT_RANGES], "bytes");
        assert!(response.headers.get(header::CONTENT_RANGE).is_none());
        assert_eq!(body_of(response).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_whole_file_range_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(1000);
        let paths = complete_entry(dir.path(), &data).await;

        let response = reader(64).read(&paths, "video", Some("bytes=0-")).await.unwrap();
        assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers[header::CONTENT_RANGE], "bytes 0-999/1000");
        assert_eq!(body_of(response).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_range_end_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(1000);
        let paths = complete_entry(dir.path(), &data).await;

        let response = reader(64)
            .read(&paths, "video", Some("bytes=995-5000"))
            .await
            .unwrap();
        assert_eq!(response.headers[header::CONTENT_RANGE], "bytes 995-999/1000");
        assert_eq!(response.headers[header::CONTENT_LENGTH], "5");
        assert_eq!(body_of(response).await.unwrap(), &data[995..]);
    }

    #[tokio::test]
    async fn test_chunks_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(1000);
        let paths = complete_entry(dir.path(), &data).await;

        let response = reader(100).read(&paths, "video", Some("bytes=5-")).await.unwrap();
        let chunks: Vec<Bytes> = response.body.try_collect().await.unwrap();
        assert!(chunks.iter().all(|c| c.len() <= 100));
        assert_eq!(chunks.concat(), &data[5..]);
    }

    #[tokio::test]
    async fn test_start_past_end_not_satisfiable() {
        let dir = tempfile::tempdir().unwrap();
        let paths = complete_entry(dir.path(), &payload(1000)).await;

        let err = reader(64)
            .read(&paths, "video", Some("bytes=1000-"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::RangeNotSatisfiable {
                start: 1000,
                size: 1000
            }
        ));
        assert_eq!(err.to_http_status(), 416);
    }

    #[tokio::test]
    async fn test_truncated_file_detected_before_headers() {
        let dir = tempfile::tempdir().unwrap();
        let paths = complete_entry(dir.path(), &payload(1000)).await;
        tokio::fs::write(&paths.data, payload(600)).await.unwrap();

        let err = reader(64).read(&paths, "video", None).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::TruncatedCache {
                expected: 1000,
                actual: 600
            }
        ));
        assert_eq!(err.to_http_status(), 500);
    }

    #[tokio::test]
    async fn test_short_read_mid_stream_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CacheLayout::new(dir.path()).resolve("https://cdn.example.com/legacy.mp4");
        tokio::fs::write(&paths.data, payload(1000)).await.unwrap();
        // Marker without a recorded length
        tokio::fs::write(&paths.marker, b"").await.unwrap();

        let response = reader(100).read(&paths, "video", None).await.unwrap();
        tokio::fs::OpenOptions::new()
            .write(true)
            .open(&paths.data)
            .await
            .unwrap()
            .set_len(250)
            .await
            .unwrap();

        let result = body_of(response).await;
        assert!(matches!(result, Err(ProxyError::TruncatedCache { .. })));
    }
}
