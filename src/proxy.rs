//! Proxy Orchestrator
//!
//! Per request, the orchestrator resolves the cache key and probes the
//! filesystem for the completion marker. Complete entries go to the
//! [`RangeCacheReader`]. Anything else makes sure a Full Fetch Worker is in
//! flight for the key and serves the current client through the
//! [`TeeStreamer`]. Completion is never remembered between requests.

use crate::cache_key::{CacheLayout, CachePaths};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::full_fetch::{FetchJob, FullFetchWorker};
use crate::metrics::ProxyMetrics;
use crate::models::{PopulationState, ProxyResponse, StreamRequest};
use crate::origin::{OriginClient, OriginRequest};
use crate::population::PopulationRegistry;
use crate::range_reader::RangeCacheReader;
use crate::supervisor::{WorkerReport, WorkerSupervisor};
use crate::tee_streamer::TeeStreamer;
use futures::{StreamExt, TryStreamExt};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// How long a measured cache size is trusted before the directory is rescanned
const USAGE_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Cache directory size, rescanned at most once per refresh interval
#[derive(Debug)]
struct UsageSampler {
    layout: CacheLayout,
    refresh: Duration,
    last: Mutex<Option<(Instant, u64)>>,
}

impl UsageSampler {
    fn new(layout: CacheLayout, refresh: Duration) -> Self {
        UsageSampler {
            layout,
            refresh,
            last: Mutex::new(None),
        }
    }

    fn cached(&self) -> Option<u64> {
        let last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        (*last)
            .filter(|(at, _)| at.elapsed() < self.refresh)
            .map(|(_, used)| used)
    }

    async fn usage_bytes(&self) -> Result<u64> {
        if let Some(used) = self.cached() {
            return Ok(used);
        }
        let used = self.layout.usage_bytes().await?;
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some((Instant::now(), used));
        Ok(used)
    }
}

/// Entry point for content requests
///
/// Cheap to clone; all clones share the same registry, workers and metrics.
#[derive(Clone)]
pub struct PreviewProxy {
    config: Arc<ProxyConfig>,
    metrics: Arc<ProxyMetrics>,
    layout: CacheLayout,
    registry: Arc<PopulationRegistry>,
    usage: Arc<UsageSampler>,
    supervisor: Arc<WorkerSupervisor>,
    tee: Arc<TeeStreamer>,
    reader: Arc<RangeCacheReader>,
}

impl PreviewProxy {
    /// Create a new PreviewProxy
    ///
    /// Creates the cache directory if it does not exist yet.
    ///
    /// # Example
    /// ```
    /// use preview_cache::{PreviewProxy, ProxyConfig};
    /// use std::sync::Arc;
    ///
    /// let config = ProxyConfig::default();
    /// let proxy = PreviewProxy::new(Arc::new(config)).unwrap();
    /// assert_eq!(proxy.metrics().get_stats().total_requests, 0);
    /// ```
    pub fn new(config: Arc<ProxyConfig>) -> Result<Self> {
        let layout = CacheLayout::new(config.cache_dir());
        std::fs::create_dir_all(layout.dir())?;

        let metrics = Arc::new(ProxyMetrics::new());
        let origin = OriginClient::new(config.origin_timeout())?;
        let registry = Arc::new(PopulationRegistry::new());
        let usage = Arc::new(UsageSampler::new(layout.clone(), USAGE_REFRESH_INTERVAL));

        let worker = Arc::new(FullFetchWorker::new(
            origin.clone(),
            config.fetch_chunk_size,
            metrics.clone(),
        ));
        let supervisor = Arc::new(WorkerSupervisor::new(worker, metrics.clone()));
        let tee = Arc::new(TeeStreamer::new(
            origin,
            registry.clone(),
            config.stream_chunk_size,
            metrics.clone(),
        ));
        let reader = Arc::new(RangeCacheReader::new(
            config.stream_chunk_size,
            metrics.clone(),
        ));

        info!("Preview proxy using cache directory {}", layout.dir().display());

        Ok(PreviewProxy {
            config,
            metrics,
            layout,
            registry,
            usage,
            supervisor,
            tee,
            reader,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    pub fn metrics_arc(&self) -> Arc<ProxyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Subscribe to outcomes of workers that finish from now on
    pub fn subscribe_workers(&self) -> broadcast::Receiver<WorkerReport> {
        self.supervisor.subscribe()
    }

    /// Current population state of `url`, read from the filesystem
    pub async fn population_state(&self, url: &str) -> PopulationState {
        self.layout.resolve(url).state().await
    }

    /// Whether a Full Fetch Worker is in flight for `url`
    pub fn is_populating(&self, url: &str) -> bool {
        let paths = self.layout.resolve(url);
        self.registry.is_worker_running(&paths.key)
    }

    /// Handle one content request
    ///
    /// # Returns
    /// * `Ok(ProxyResponse)` with status 200 or 206 and a lazy body
    /// * `Err(ProxyError)` before any header was produced; map it with
    ///   [`ProxyError::to_http_status`]
    pub async fn handle(&self, request: &StreamRequest) -> Result<ProxyResponse> {
        let start = Instant::now();
        self.metrics.record_request(request.range.is_some());

        let result = self.dispatch(request).await;
        let elapsed = start.elapsed();
        self.metrics.record_request_duration(elapsed);
        self.logging(request, result.as_ref().err(), elapsed);

        match result {
            Ok(response) => Ok(self.count_client_bytes(response)),
            Err(e) => {
                self.metrics.record_request_failure();
                if matches!(e, ProxyError::TruncatedCache { .. }) {
                    self.metrics.record_cache_error();
                }
                Err(e)
            }
        }
    }

    async fn dispatch(&self, request: &StreamRequest) -> Result<ProxyResponse> {
        let paths = self.layout.resolve(&request.resource_url);

        if paths.is_complete().await {
            debug!("Cache hit key={} url={}", paths.key, request.resource_url);
            self.metrics.record_cache_hit();
            return self
                .reader
                .read(&paths, &request.title, request.range.as_deref())
                .await;
        }

        debug!("Cache miss key={} url={}", paths.key, request.resource_url);
        self.metrics.record_cache_miss();

        let admitted = self.admit(&paths).await;
        if admitted {
            self.ensure_worker(request, &paths)?;
        } else {
            self.metrics.record_worker_suppressed();
        }

        self.tee.stream(request, admitted.then_some(&paths)).await
    }

    /// Start a worker for `paths` unless one is already in flight
    fn ensure_worker(&self, request: &StreamRequest, paths: &CachePaths) -> Result<()> {
        let origin_request = OriginRequest::new(&request.resource_url, &request.user_agent)?;

        match self.registry.try_start_worker(&paths.key) {
            Some(ticket) => {
                let job = FetchJob {
                    request: origin_request,
                    paths: paths.clone(),
                };
                if !self.supervisor.spawn(job, ticket) {
                    self.metrics.record_worker_suppressed();
                }
            }
            None => {
                debug!("Worker already running for key={}", paths.key);
                self.metrics.record_worker_suppressed();
            }
        }
        Ok(())
    }

    /// Whether a new population may grow the cache directory
    ///
    /// The directory size may be up to one refresh interval old.
    async fn admit(&self, paths: &CachePaths) -> bool {
        let Some(cap) = self.config.max_cache_bytes else {
            return true;
        };

        match self.usage.usage_bytes().await {
            Ok(used) if used >= cap => {
                info!(
                    "Cache at capacity ({} of {} bytes), streaming key={} without caching",
                    used, cap, paths.key
                );
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to measure cache usage: {}", e);
                true
            }
        }
    }

    fn count_client_bytes(&self, response: ProxyResponse) -> ProxyResponse {
        let metrics = self.metrics.clone();
        let body = response
            .body
            .inspect_ok(move |chunk| metrics.record_bytes_to_client(chunk.len() as u64))
            .boxed();
        ProxyResponse { body, ..response }
    }

    /// Log the outcome of a request
    pub fn logging(&self, request: &StreamRequest, error: Option<&ProxyError>, duration: Duration) {
        if let Some(err) = error {
            warn!(
                "Request failed: url={}, range={:?}, error={}, duration_ms={}",
                request.resource_url,
                request.range,
                err,
                duration.as_millis()
            );
        } else {
            info!(
                "Request dispatched: url={}, range={:?}, duration_ms={}",
                request.resource_url,
                request.range,
                duration.as_millis()
            );
        }
    }

    /// Cancel in-flight workers and wait for them to stop
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}
