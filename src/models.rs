//! Core data models for the preview cache proxy

use crate::error::{ProxyError, Result};
use bytes::Bytes;
use futures::stream::BoxStream;
use http::{HeaderMap, HeaderValue, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

/// Lazily produced response body
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Characters left unescaped in the Content-Disposition filename
const FILENAME_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Default MIME type for proxied media
pub const DEFAULT_CONTENT_TYPE: &str = "video/mp4";

/// Represents a resolved, inclusive byte range within a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// Starting byte position (inclusive)
    pub start: u64,
    /// Ending byte position (inclusive)
    pub end: u64,
}

impl ByteRange {
    /// Create a new ByteRange
    ///
    /// # Returns
    /// * `Ok(ByteRange)` if the range is valid
    /// * `Err(ProxyError)` if start > end
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(ProxyError::InternalError(format!(
                "start ({}) must be <= end ({})",
                start, end
            )));
        }
        Ok(ByteRange { start, end })
    }

    /// Get the size of this byte range in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for a `Content-Range` header against a resource of `total` bytes
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }

    /// Convert this ByteRange to an HTTP Range header value
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// A single `bytes=start-end?` range as requested by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    /// Inclusive end; `None` means "to the end of the resource"
    pub end: Option<u64>,
}

impl RangeSpec {
    /// Resolve against a resource of `size` bytes
    ///
    /// An omitted or oversized end is clamped to the last byte. A start at or
    /// past the end of the resource cannot be satisfied.
    pub fn resolve(&self, size: u64) -> Result<ByteRange> {
        if self.start >= size {
            return Err(ProxyError::RangeNotSatisfiable {
                start: self.start,
                size,
            });
        }
        let last = size - 1;
        let end = self.end.map_or(last, |end| end.min(last));
        ByteRange::new(self.start, end)
    }
}

/// Outcome of parsing a client `Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// A well-formed single range
    Range(RangeSpec),
    /// Header present but not of the supported `bytes=<n>-<n?>` form
    Malformed,
}

impl RangeRequest {
    /// Parse a `Range` header value
    ///
    /// Only `bytes=<start>-<end?>` with decimal positions is understood.
    /// Suffix ranges, range lists and `start > end` are all malformed.
    pub fn parse(header: &str) -> Self {
        let header = header.trim();
        let Some(range_part) = header.strip_prefix("bytes=") else {
            return RangeRequest::Malformed;
        };

        let Some((start, end)) = range_part.split_once('-') else {
            return RangeRequest::Malformed;
        };
        let (start, end) = (start.trim(), end.trim());

        if !is_decimal(start) || (!end.is_empty() && !is_decimal(end)) {
            return RangeRequest::Malformed;
        }

        let Ok(start) = start.parse::<u64>() else {
            return RangeRequest::Malformed;
        };
        let end = if end.is_empty() {
            None
        } else {
            match end.parse::<u64>() {
                Ok(end) if end >= start => Some(end),
                _ => return RangeRequest::Malformed,
            }
        };

        RangeRequest::Range(RangeSpec { start, end })
    }
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// One client request for content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Ready-to-fetch origin URL of the media resource
    pub resource_url: String,
    /// User-Agent forwarded to the origin
    pub user_agent: String,
    /// Human title used for the served filename
    pub title: String,
    /// Raw `Range` header, if the client sent one
    pub range: Option<String>,
}

impl StreamRequest {
    pub fn new(
        resource_url: impl Into<String>,
        user_agent: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        StreamRequest {
            resource_url: resource_url.into(),
            user_agent: user_agent.into(),
            title: title.into(),
            range: None,
        }
    }

    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }
}

/// Population state of a cache entry, derived from the filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulationState {
    /// No data file yet
    Absent,
    /// Data file exists, completion marker does not
    Populating,
    /// Completion marker exists; the entry is immutable
    Complete,
}

/// Response produced by the proxy, independent of the HTTP server
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl std::fmt::Debug for ProxyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// `Content-Disposition` value serving `title` inline as an mp4 file
pub fn content_disposition(title: &str) -> HeaderValue {
    let filename = format!("{}.mp4", title);
    let encoded = utf8_percent_encode(&filename, FILENAME_ESCAPE);
    // Percent-encoded output is plain ASCII
    HeaderValue::from_str(&format!("inline; filename=\"{}\"", encoded))
        .unwrap_or_else(|_| HeaderValue::from_static("inline"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_range_new() {
        let range = ByteRange::new(0, 1023).unwrap();
        assert_eq!(range.size(), 1024);
        assert_eq!(range.to_header(), "bytes=0-1023");
        assert_eq!(range.content_range(4096), "bytes 0-1023/4096");
    }

    #[test]
    fn test_byte_range_invalid() {
        assert!(ByteRange::new(100, 50).is_err());
    }

    #[test]
    fn test_parse_closed_range() {
        assert_eq!(
            RangeRequest::parse("bytes=10-10"),
            RangeRequest::Range(RangeSpec {
                start: 10,
                end: Some(10)
            })
        );
    }

    #[test]
    fn test_parse_open_range() {
        assert_eq!(
            RangeRequest::parse("bytes=990-"),
            RangeRequest::Range(RangeSpec {
                start: 990,
                end: None
            })
        );
    }

    #[test]
    fn test_parse_malformed() {
        for header in [
            "bytes=abc",
            "bytes=-500",
            "bytes=5-1",
            "bytes=0-1,5-9",
            "items=0-10",
            "bytes=",
            "bytes=1-x",
            "",
        ] {
            assert_eq!(RangeRequest::parse(header), RangeRequest::Malformed, "{}", header);
        }
    }

    #[test]
    fn test_resolve_clamps_end() {
        let spec = RangeSpec {
            start: 990,
            end: Some(5000),
        };
        assert_eq!(spec.resolve(1000).unwrap(), ByteRange::new(990, 999).unwrap());

        let open = RangeSpec { start: 0, end: None };
        assert_eq!(open.resolve(1000).unwrap(), ByteRange::new(0, 999).unwrap());
    }

    #[test]
    fn test_resolve_start_past_end() {
        let spec = RangeSpec {
            start: 1000,
            end: None,
        };
        assert!(matches!(
            spec.resolve(1000),
            Err(ProxyError::RangeNotSatisfiable { start: 1000, size: 1000 })
        ));
        assert!(spec.resolve(0).is_err());
    }

    #[test]
    fn test_content_disposition_encodes_title() {
        let value = content_disposition("My \"Great\" Clip");
        assert_eq!(
            value.to_str().unwrap(),
            "inline; filename=\"My%20%22Great%22%20Clip.mp4\""
        );
    }

    #[test]
    fn test_content_disposition_unicode() {
        let value = content_disposition("vidéo");
        assert_eq!(value.to_str().unwrap(), "inline; filename=\"vid%C3%A9o.mp4\"");
    }
}
