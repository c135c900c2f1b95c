//! Full Fetch Worker: populates a cache entry end to end
//!
//! The worker learns the expected size with a HEAD request, takes the writer
//! over from whoever holds it, and continues from the last durably written
//! byte. Once the data file holds exactly the expected number of bytes it is
//! synced and the completion marker is published.

use crate::cache_key::CachePaths;
use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;
use crate::origin::{rechunk, OriginClient, OriginRequest};
use crate::population::WorkerTicket;
use futures::StreamExt;
use http::StatusCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Everything a worker needs to populate one entry
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub request: OriginRequest,
    pub paths: CachePaths,
}

/// Fetches whole resources from origin into the cache
pub struct FullFetchWorker {
    origin: OriginClient,
    chunk_size: usize,
    metrics: Arc<ProxyMetrics>,
}

impl FullFetchWorker {
    /// # Arguments
    /// * `origin` - Origin HTTP client
    /// * `chunk_size` - Maximum bytes held in memory between origin and disk
    /// * `metrics` - Shared metrics collector
    pub fn new(origin: OriginClient, chunk_size: usize, metrics: Arc<ProxyMetrics>) -> Self {
        FullFetchWorker {
            origin,
            chunk_size,
            metrics,
        }
    }

    /// Populate the entry described by `job`
    ///
    /// # Returns
    /// * `Ok(len)` once the marker is written (or already existed)
    /// * `Err(ProxyError::SizeUnknown)` if HEAD gave no usable length
    /// * `Err(ProxyError::IncompleteBody)` if the body length disagreed with HEAD
    /// * `Err(ProxyError::Cancelled)` if `cancel` fired mid-transfer
    pub async fn run(
        &self,
        job: &FetchJob,
        ticket: &WorkerTicket,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let paths = &job.paths;
        if paths.is_complete().await {
            debug!("Entry key={} already complete, nothing to fetch", paths.key);
            return Ok(paths.recorded_length().await.unwrap_or_default());
        }

        let metadata = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            metadata = self.origin.fetch_metadata(&job.request) => metadata?,
        };
        let expected = match metadata.content_length {
            Some(len) if len > 0 => len,
            _ => {
                return Err(ProxyError::SizeUnknown(format!(
                    "no usable Content-Length for {}",
                    job.request.url()
                )))
            }
        };

        let mut lease = ticket.take_over_writer(paths).await?;
        if lease.offset() > expected {
            lease.reset().await?;
        }

        if lease.offset() < expected {
            let resume = (lease.offset() > 0).then(|| lease.offset());
            let mut response = self.origin.open(&job.request, resume).await?;

            if let Some(offset) = resume {
                let resumed = response.status == StatusCode::PARTIAL_CONTENT
                    && response.range_start == Some(offset);
                if resumed {
                    info!("Resuming key={} at offset {}/{}", paths.key, offset, expected);
                } else {
                    info!(
                        "Origin did not honor resume for key={} (status={}), refetching from 0",
                        paths.key, response.status
                    );
                    lease.reset().await?;
                    if response.status == StatusCode::PARTIAL_CONTENT {
                        response = self.origin.open(&job.request, None).await?;
                    }
                }
            }

            let mut body = rechunk(response.body, self.chunk_size);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                    next = body.next() => next,
                };
                let chunk = match next {
                    Some(chunk) => chunk?,
                    None => break,
                };

                let received = lease.offset() + chunk.len() as u64;
                if received > expected {
                    return Err(ProxyError::IncompleteBody { expected, received });
                }
                if !lease.append(&chunk).await? {
                    return Err(ProxyError::InternalError(format!(
                        "worker lost writer for key={}",
                        paths.key
                    )));
                }
                self.metrics.record_bytes_from_origin(chunk.len() as u64);
            }
        }

        if lease.offset() != expected {
            return Err(ProxyError::IncompleteBody {
                expected,
                received: lease.offset(),
            });
        }

        let len = lease.commit(paths).await?;
        info!("Cache entry key={} complete ({} bytes)", paths.key, len);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::CacheLayout;
    use crate::population::PopulationRegistry;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn worker() -> FullFetchWorker {
        FullFetchWorker::new(
            OriginClient::new(Duration::from_secs(5)).unwrap(),
            256 * 1024,
            Arc::new(ProxyMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_missing_size_aborts_without_marker() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/nosize.mp4"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/nosize.mp4", server.uri());
        let job = FetchJob {
            request: OriginRequest::new(&url, "ua").unwrap(),
            paths: CacheLayout::new(dir.path()).resolve(&url),
        };
        let registry = PopulationRegistry::new();
        let ticket = registry.try_start_worker(&job.paths.key).unwrap();

        let result = worker().run(&job, &ticket, &CancellationToken::new()).await;
        assert!(matches!(result, Err(ProxyError::SizeUnknown(_))));
        assert!(!job.paths.marker.exists());
    }

    #[tokio::test]
    async fn test_origin_rejection_leaves_no_marker() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/gone.mp4"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/gone.mp4", server.uri());
        let job = FetchJob {
            request: OriginRequest::new(&url, "ua").unwrap(),
            paths: CacheLayout::new(dir.path()).resolve(&url),
        };
        let registry = PopulationRegistry::new();
        let ticket = registry.try_start_worker(&job.paths.key).unwrap();

        let result = worker().run(&job, &ticket, &CancellationToken::new()).await;
        assert!(matches!(result, Err(ProxyError::OriginRejected { status: 403, .. })));
        assert!(!job.paths.marker.exists());
    }

    #[tokio::test]
    async fn test_full_fetch_writes_data_and_marker() {
        let server = MockServer::start().await;
        let data = payload(600 * 1024);
        Mock::given(method("HEAD"))
            .and(path("/full.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/full.mp4"))
            .and(header("referer", format!("https://{}", server.address()).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/full.mp4", server.uri());
        let job = FetchJob {
            request: OriginRequest::new(&url, "ua").unwrap(),
            paths: CacheLayout::new(dir.path()).resolve(&url),
        };
        let registry = PopulationRegistry::new();
        let ticket = registry.try_start_worker(&job.paths.key).unwrap();

        let len = worker().run(&job, &ticket, &CancellationToken::new()).await.unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(tokio::fs::read(&job.paths.data).await.unwrap(), data);
        assert_eq!(job.paths.recorded_length().await, Some(data.len() as u64));
    }

    #[tokio::test]
    async fn test_resumes_after_streamer_prefix() {
        let server = MockServer::start().await;
        let data = payload(1000);
        Mock::given(method("HEAD"))
            .and(path("/resume.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/resume.mp4"))
            .and(header("range", "bytes=300-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 300-999/1000")
                    .set_body_bytes(data[300..].to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/resume.mp4", server.uri());
        let job = FetchJob {
            request: OriginRequest::new(&url, "ua").unwrap(),
            paths: CacheLayout::new(dir.path()).resolve(&url),
        };
        let registry = PopulationRegistry::new();

        let mut streamer = registry.claim_streamer(&job.paths).await.unwrap().unwrap();
        assert!(streamer.append(&data[..300]).await.unwrap());

        let ticket = registry.try_start_worker(&job.paths.key).unwrap();
        let len = worker().run(&job, &ticket, &CancellationToken::new()).await.unwrap();

        assert_eq!(len, 1000);
        assert_eq!(tokio::fs::read(&job.paths.data).await.unwrap(), data);
        assert!(!streamer.append(b"late").await.unwrap());
    }

    #[tokio::test]
    async fn test_short_body_is_not_marked_complete() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/short.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(1000)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/short.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(400)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("{}/short.mp4", server.uri());
        let job = FetchJob {
            request: OriginRequest::new(&url, "ua").unwrap(),
            paths: CacheLayout::new(dir.path()).resolve(&url),
        };
        let registry = PopulationRegistry::new();
        let ticket = registry.try_start_worker(&job.paths.key).unwrap();

        let result = worker().run(&job, &ticket, &CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(ProxyError::IncompleteBody {
                expected: 1000,
                received: 400
            })
        ));
        assert!(!job.paths.marker.exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let url = "http://127.0.0.1:9/never.mp4";
        let job = FetchJob {
            request: OriginRequest::new(url, "ua").unwrap(),
            paths: CacheLayout::new(dir.path()).resolve(url),
        };
        let registry = PopulationRegistry::new();
        let ticket = registry.try_start_worker(&job.paths.key).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = worker().run(&job, &ticket, &cancel).await;
        assert!(matches!(result, Err(ProxyError::Cancelled)));
    }
}
