//! Supervised background execution of Full Fetch Workers
//!
//! Workers are detached from the request that started them: a client
//! disconnecting never stops population. They are still owned by the
//! supervisor, which can cancel them and wait for them on shutdown, and which
//! publishes the outcome of every worker on a broadcast channel.

use crate::cache_key::CacheKey;
use crate::error::ProxyError;
use crate::full_fetch::{FetchJob, FullFetchWorker};
use crate::metrics::ProxyMetrics;
use crate::population::WorkerTicket;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

const REPORT_CHANNEL_CAPACITY: usize = 256;

/// Outcome of one finished worker
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub key: CacheKey,
    pub url: String,
    /// Byte length of the completed entry, or why population failed
    pub outcome: Result<u64, ProxyError>,
    pub elapsed: Duration,
}

impl WorkerReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Owns every in-flight worker task
pub struct WorkerSupervisor {
    worker: Arc<FullFetchWorker>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    reports: broadcast::Sender<WorkerReport>,
    metrics: Arc<ProxyMetrics>,
}

impl WorkerSupervisor {
    pub fn new(worker: Arc<FullFetchWorker>, metrics: Arc<ProxyMetrics>) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        WorkerSupervisor {
            worker,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            reports,
            metrics,
        }
    }

    /// Receive a [`WorkerReport`] for every worker that finishes from now on
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerReport> {
        self.reports.subscribe()
    }

    /// Number of worker tasks still running
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `job` in the background
    ///
    /// The ticket is held for the lifetime of the task and dropped before the
    /// report is published. Returns `false` if the supervisor is shutting down,
    /// in which case the ticket is released immediately.
    pub fn spawn(&self, job: FetchJob, ticket: WorkerTicket) -> bool {
        if self.cancel.is_cancelled() {
            warn!("Supervisor shutting down, not starting worker for key={}", ticket.key());
            return false;
        }

        let worker = self.worker.clone();
        let cancel = self.cancel.child_token();
        let reports = self.reports.clone();
        let metrics = self.metrics.clone();
        metrics.record_worker_started();

        self.tracker.spawn(async move {
            let start = Instant::now();
            let key = ticket.key().clone();
            let url = job.request.url().to_string();
            info!("Worker started key={} url={}", key, url);

            let outcome = worker.run(&job, &ticket, &cancel).await;
            drop(ticket);

            let elapsed = start.elapsed();
            match &outcome {
                Ok(len) => info!(
                    "Worker finished key={} bytes={} elapsed={:?}",
                    key, len, elapsed
                ),
                Err(ProxyError::Cancelled) => warn!("Worker cancelled key={}", key),
                Err(ProxyError::SizeUnknown(msg)) => {
                    warn!("Unable to fetch video size key={}: {}", key, msg)
                }
                Err(e) => error!("Worker failed key={} url={}: {}", key, url, e),
            }
            metrics.record_worker_finished(outcome.is_ok());

            // Nobody listening is fine
            let _ = reports.send(WorkerReport {
                key,
                url,
                outcome,
                elapsed,
            });
        });
        true
    }

    /// Cancel all workers and wait for them to stop
    pub async fn shutdown(&self) {
        info!("Shutting down {} worker(s)", self.tracker.len());
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
