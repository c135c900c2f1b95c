//! Origin client for fetching media resources
//!
//! All requests carry the same header set: the client's `User-Agent`, a
//! `Referer` naming the origin host of the resource, and `Connection:
//! keep-alive`. Only connection setup and the wait for response headers are
//! bounded by a timeout; body streaming is not.

use crate::error::{ProxyError, Result};
use crate::models::ByteStream;
use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt, TryStreamExt};
use http::header::{self, HeaderMap, HeaderValue};
use http::StatusCode;
use reqwest::Client;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Request parameters shared by every origin call for one resource
#[derive(Debug, Clone)]
pub struct OriginRequest {
    url: String,
    headers: HeaderMap,
}

impl OriginRequest {
    /// Build the origin header set for `url`
    ///
    /// # Returns
    /// * `Err(ProxyError::InvalidRequest)` if the URL has no host or the
    ///   user agent is not a valid header value
    pub fn new(url: &str, user_agent: &str) -> Result<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| ProxyError::InvalidRequest(format!("invalid resource url: {}", e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ProxyError::InvalidRequest(format!("resource url has no host: {}", url)))?;
        let authority = match parsed.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_str(user_agent)
                .map_err(|e| ProxyError::InvalidRequest(format!("invalid user agent: {}", e)))?,
        );
        headers.insert(
            header::REFERER,
            HeaderValue::from_str(&format!("https://{}", authority))
                .map_err(|e| ProxyError::InvalidRequest(format!("invalid referer: {}", e)))?,
        );
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

        Ok(OriginRequest {
            url: url.to_string(),
            headers,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Metadata learned from a HEAD request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginMetadata {
    /// Declared size, `None` when missing or unparsable
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

/// An open streaming GET response
pub struct OriginResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    /// First byte position from `Content-Range` on a 206
    pub range_start: Option<u64>,
    pub body: ByteStream,
}

/// HTTP client used for all origin traffic
#[derive(Debug, Clone)]
pub struct OriginClient {
    client: Client,
    timeout: Duration,
}

impl OriginClient {
    /// Create a new OriginClient with the given connect/response timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| ProxyError::InternalError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(OriginClient { client, timeout })
    }

    async fn send_with_timeout<F>(&self, url: &str, send: F) -> Result<reqwest::Response>
    where
        F: Future<Output = reqwest::Result<reqwest::Response>>,
    {
        match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                warn!("Origin request failed for url={}: {}", url, e);
                Err(e.into())
            }
            Err(_) => {
                warn!("Origin request timed out for url={} after {:?}", url, self.timeout);
                Err(ProxyError::Timeout(format!(
                    "no response from origin within {:?}",
                    self.timeout
                )))
            }
        }
    }

    fn check_status(url: &str, response: &reqwest::Response) -> Result<()> {
        let status = response.status();
        if !status.is_success() {
            warn!("Origin returned error for url={}: status={}", url, status);
            return Err(ProxyError::origin_rejected(
                status.as_u16(),
                format!("Origin server returned {}", status),
            ));
        }
        Ok(())
    }

    /// Fetch metadata for a resource using a HEAD request
    ///
    /// A missing or unparsable Content-Length is not an error here; callers
    /// decide what an unknown size means to them.
    pub async fn fetch_metadata(&self, request: &OriginRequest) -> Result<OriginMetadata> {
        debug!("Fetching metadata for url={}", request.url);

        let send = self
            .client
            .head(&request.url)
            .headers(request.headers.clone())
            .send();
        let response = self.send_with_timeout(&request.url, send).await?;
        Self::check_status(&request.url, &response)?;

        // Read the header directly: a HEAD body is empty, so the body size hint is useless
        let headers = response.headers();
        let content_length = header_str(headers, header::CONTENT_LENGTH)
            .and_then(|v| v.parse::<u64>().ok());
        let content_type = header_str(headers, header::CONTENT_TYPE).map(str::to_string);

        info!(
            "Fetched metadata for url={}: size={:?}, content_type={:?}",
            request.url, content_length, content_type
        );

        Ok(OriginMetadata {
            content_length,
            content_type,
        })
    }

    /// Open a streaming GET, optionally starting at byte `from`
    ///
    /// Fails fast on connection errors, timeouts and non-2xx statuses.
    pub async fn open(&self, request: &OriginRequest, from: Option<u64>) -> Result<OriginResponse> {
        let mut builder = self.client.get(&request.url).headers(request.headers.clone());
        if let Some(offset) = from {
            builder = builder.header(header::RANGE, format!("bytes={}-", offset));
        }
        debug!("Opening origin stream url={} from={:?}", request.url, from);

        let response = self.send_with_timeout(&request.url, builder.send()).await?;
        Self::check_status(&request.url, &response)?;

        let status = response.status();
        let headers = response.headers();
        let content_type = header_str(headers, header::CONTENT_TYPE).map(str::to_string);
        let content_length = header_str(headers, header::CONTENT_LENGTH)
            .and_then(|v| v.parse::<u64>().ok());
        let range_start = if status == StatusCode::PARTIAL_CONTENT {
            header_str(headers, header::CONTENT_RANGE).and_then(parse_content_range_start)
        } else {
            None
        };

        let body = response.bytes_stream().map_err(ProxyError::from).boxed();

        Ok(OriginResponse {
            status,
            content_type,
            content_length,
            range_start,
            body,
        })
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extract the first byte position from `bytes <start>-<end>/<total>`
fn parse_content_range_start(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes ")?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

/// Regroup a byte stream into chunks of exactly `bound` bytes
///
/// Only the final chunk may be shorter. Errors from the inner stream are
/// passed through and end the stream.
pub fn rechunk(inner: ByteStream, bound: usize) -> ByteStream {
    struct State {
        inner: ByteStream,
        buf: BytesMut,
        exhausted: bool,
    }

    let state = State {
        inner,
        buf: BytesMut::new(),
        exhausted: false,
    };

    stream::try_unfold(state, move |mut st| async move {
        loop {
            if st.buf.len() >= bound {
                let chunk: Bytes = st.buf.split_to(bound).freeze();
                return Ok(Some((chunk, st)));
            }
            if st.exhausted {
                if st.buf.is_empty() {
                    return Ok(None);
                }
                let chunk = st.buf.split().freeze();
                return Ok(Some((chunk, st)));
            }
            match st.inner.next().await {
                Some(Ok(bytes)) => st.buf.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(e),
                None => st.exhausted = true,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(parts: Vec<&'static [u8]>) -> ByteStream {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p)))).boxed()
    }

    #[test]
    fn test_origin_request_headers() {
        let request = OriginRequest::new("https://cdn.example.com/v/1.mp4?sig=abc", "TestAgent/1.0").unwrap();
        let headers = request.headers();
        assert_eq!(headers[header::USER_AGENT], "TestAgent/1.0");
        assert_eq!(headers[header::REFERER], "https://cdn.example.com");
        assert_eq!(headers[header::CONNECTION], "keep-alive");
    }

    #[test]
    fn test_origin_request_keeps_port() {
        let request = OriginRequest::new("http://127.0.0.1:8081/a.mp4", "ua").unwrap();
        assert_eq!(request.headers()[header::REFERER], "https://127.0.0.1:8081");
    }

    #[test]
    fn test_origin_request_invalid_url() {
        assert!(matches!(
            OriginRequest::new("not-a-valid-url", "ua"),
            Err(ProxyError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_parse_content_range_start() {
        assert_eq!(parse_content_range_start("bytes 300-999/1000"), Some(300));
        assert_eq!(parse_content_range_start("bytes */1000"), None);
        assert_eq!(parse_content_range_start("garbage"), None);
    }

    #[tokio::test]
    async fn test_rechunk_regroups() {
        let out: Vec<Bytes> = rechunk(chunks(vec![b"ab", b"cdefg", b"h", b"ij"]), 4)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(out, vec![Bytes::from("abcd"), Bytes::from("efgh"), Bytes::from("ij")]);
    }

    #[tokio::test]
    async fn test_rechunk_empty() {
        let out: Vec<Bytes> = rechunk(chunks(vec![]), 4).try_collect().await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_rechunk_propagates_error() {
        let inner = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(ProxyError::OriginUnreachable("reset".into())),
        ])
        .boxed();
        let result: Result<Vec<Bytes>> = rechunk(inner, 2).try_collect().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_client_creation() {
        assert!(OriginClient::new(Duration::from_secs(5)).is_ok());
    }
}
