//! Tee Streamer: serve from origin while copying into the cache
//!
//! Used whenever an entry is not yet complete. Each chunk pulled from the
//! origin is appended to the cache data file first and only then handed to
//! the client. Caching is best effort: if the stream never obtained the writer,
//! loses it to a Full Fetch Worker, or hits a disk error, it keeps serving the
//! client straight from origin without touching the file again.
//!
//! The tee always serves from byte 0 and ignores any client `Range` header.

use crate::cache_key::{CacheKey, CachePaths};
use crate::error::Result;
use crate::metrics::ProxyMetrics;
use crate::models::{content_disposition, ByteStream, ProxyResponse, StreamRequest, DEFAULT_CONTENT_TYPE};
use crate::origin::{rechunk, OriginClient, OriginRequest};
use crate::population::{PopulationRegistry, WriterLease};
use bytes::Bytes;
use futures::{stream, StreamExt};
use http::header::{self, HeaderMap, HeaderValue};
use http::StatusCode;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Origin body wrapped so every chunk is persisted before it is yielded
pub struct TeeStream {
    inner: ByteStream,
    sink: Option<WriterLease>,
    key: Option<CacheKey>,
    metrics: Arc<ProxyMetrics>,
    done: bool,
}

impl TeeStream {
    /// # Arguments
    /// * `inner` - Origin body, already bounded to the desired chunk size
    /// * `sink` - Writer lease for the cache data file, if one was obtained
    pub fn new(inner: ByteStream, sink: Option<WriterLease>, metrics: Arc<ProxyMetrics>) -> Self {
        let key = sink.as_ref().map(|lease| lease.key().clone());
        TeeStream {
            inner,
            sink,
            key,
            metrics,
            done: false,
        }
    }

    /// Whether chunks are still being written to the cache
    pub fn is_caching(&self) -> bool {
        self.sink.is_some()
    }

    async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        if self.done {
            return None;
        }

        match self.inner.next().await {
            Some(Ok(chunk)) => {
                self.metrics.record_bytes_from_origin(chunk.len() as u64);
                self.persist(&chunk).await;
                Some(Ok(chunk))
            }
            Some(Err(e)) => {
                warn!("Origin stream failed mid-body key={:?}: {}", self.key, e);
                self.done = true;
                self.release().await;
                Some(Err(e))
            }
            None => {
                self.done = true;
                self.release().await;
                None
            }
        }
    }

    async fn persist(&mut self, chunk: &[u8]) {
        let Some(lease) = self.sink.as_mut() else {
            return;
        };

        match lease.append(chunk).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    "Tee lost writer key={} at offset {}, continuing without caching",
                    lease.key(),
                    lease.offset()
                );
                self.sink = None;
            }
            Err(e) => {
                warn!(
                    "Cache write failed key={}: {}, continuing without caching",
                    lease.key(),
                    e
                );
                self.sink = None;
            }
        }
    }

    async fn release(&mut self) {
        if let Some(lease) = self.sink.take() {
            let key = lease.key().clone();
            let written = lease.offset();
            match lease.finish().await {
                Ok(()) => debug!("Tee released writer key={} after {} bytes", key, written),
                Err(e) => warn!("Failed to sync cache file key={}: {}", key, e),
            }
        }
    }

    /// Turn the tee into a response body
    ///
    /// Dropping the returned stream stops pulling from origin; bytes already
    /// appended stay in the data file.
    pub fn into_body(self) -> ByteStream {
        stream::unfold(self, |mut tee| async move {
            let item = tee.next_chunk().await?;
            Some((item, tee))
        })
        .boxed()
    }
}

/// Serves incomplete entries straight from origin
pub struct TeeStreamer {
    origin: OriginClient,
    registry: Arc<PopulationRegistry>,
    chunk_size: usize,
    metrics: Arc<ProxyMetrics>,
}

impl TeeStreamer {
    pub fn new(
        origin: OriginClient,
        registry: Arc<PopulationRegistry>,
        chunk_size: usize,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        TeeStreamer {
            origin,
            registry,
            chunk_size,
            metrics,
        }
    }

    /// Open the origin and build the streaming response
    ///
    /// Fails before any header is produced if the origin cannot be reached or
    /// rejects the request. When `cache_target` is given the stream tries to
    /// claim the writer for it; losing that race only disables caching.
    pub async fn stream(
        &self,
        request: &StreamRequest,
        cache_target: Option<&CachePaths>,
    ) -> Result<ProxyResponse> {
        let origin_request = OriginRequest::new(&request.resource_url, &request.user_agent)?;
        let response = self.origin.open(&origin_request, None).await?;

        let mut headers = HeaderMap::new();
        let content_type = response
            .content_type
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
        headers.insert(header::CONTENT_TYPE, content_type);
        headers.insert(header::CONTENT_DISPOSITION, content_disposition(&request.title));
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if response.status == StatusCode::OK {
            if let Some(len) = response.content_length {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }
        }

        let sink = match cache_target {
            Some(paths) => match self.registry.claim_streamer(paths).await {
                Ok(lease) => lease,
                Err(e) => {
                    warn!("Could not open cache file key={}: {}", paths.key, e);
                    None
                }
            },
            None => None,
        };
        self.metrics.record_tee_stream(sink.is_some());
        info!(
            "Tee streaming url={} caching={}",
            request.resource_url,
            sink.is_some()
        );

        let body = TeeStream::new(rechunk(response.body, self.chunk_size), sink, self.metrics.clone());

        Ok(ProxyResponse {
            status: StatusCode::OK,
            headers,
            body: body.into_body(),
        })
    }
}
