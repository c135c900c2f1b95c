//! Metrics HTTP Endpoint
//!
//! Exposes [`ProxyMetrics`] in Prometheus text format. The main server serves
//! the same text on `/metrics`; this standalone listener lets operators scrape
//! on a private address instead.

use crate::metrics::{MetricsSnapshot, ProxyMetrics};
use http::header::{HeaderValue, CONTENT_TYPE};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Content type of the Prometheus text exposition format
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const PREFIX: &str = "preview_cache";

/// Standalone metrics server
pub struct MetricsEndpoint {
    metrics: Arc<ProxyMetrics>,
    addr: SocketAddr,
}

impl MetricsEndpoint {
    /// Create a new metrics endpoint
    ///
    /// # Example
    /// ```no_run
    /// use preview_cache::metrics::ProxyMetrics;
    /// use preview_cache::metrics_endpoint::MetricsEndpoint;
    /// use std::sync::Arc;
    ///
    /// let metrics = Arc::new(ProxyMetrics::new());
    /// let endpoint = MetricsEndpoint::new(metrics, "127.0.0.1:9090".parse().unwrap());
    /// ```
    pub fn new(metrics: Arc<ProxyMetrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Serve `/metrics` and `/health` until the process exits
    pub async fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics available at http://{}/metrics", self.addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let metrics = Arc::clone(&self.metrics);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = Arc::clone(&metrics);
                    async move { handle_request(req, metrics).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<ProxyMetrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => text_response(
            StatusCode::OK,
            PROMETHEUS_CONTENT_TYPE,
            format_prometheus_metrics(&metrics.get_stats()),
        ),
        "/health" => text_response(
            StatusCode::OK,
            "application/json",
            r#"{"status":"healthy"}"#.to_string(),
        ),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "404 Not Found".to_string()),
    };
    Ok(response)
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn push_metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    // Writing to a String cannot fail
    let _ = writeln!(out, "# HELP {}_{} {}", PREFIX, name, help);
    let _ = writeln!(out, "# TYPE {}_{} {}", PREFIX, name, kind);
    let _ = writeln!(out, "{}_{} {}", PREFIX, name, value);
    out.push('\n');
}

/// Format a snapshot in Prometheus exposition format
///
/// Each metric carries a HELP and a TYPE line.
pub fn format_prometheus_metrics(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    push_metric(&mut out, "requests_total", "counter", "Total number of content requests", snapshot.total_requests);
    push_metric(&mut out, "range_requests_total", "counter", "Content requests carrying a Range header", snapshot.range_requests);
    push_metric(&mut out, "failed_requests_total", "counter", "Content requests answered with an error", snapshot.failed_requests);

    push_metric(&mut out, "cache_hits_total", "counter", "Requests served from a complete cache entry", snapshot.cache_hits);
    push_metric(&mut out, "cache_misses_total", "counter", "Requests that found no complete cache entry", snapshot.cache_misses);
    push_metric(&mut out, "cache_errors_total", "counter", "Failures reading complete cache entries", snapshot.cache_errors);
    push_metric(&mut out, "cache_hit_rate", "gauge", "Cache hit rate percentage", format!("{:.2}", snapshot.cache_hit_rate()));

    push_metric(&mut out, "tee_streams_total", "counter", "Requests streamed from origin", snapshot.tee_streams);
    push_metric(&mut out, "tee_cached_streams_total", "counter", "Origin streams that also wrote the cache", snapshot.tee_cached_streams);

    push_metric(&mut out, "workers_started_total", "counter", "Full fetch workers started", snapshot.workers_started);
    push_metric(&mut out, "workers_suppressed_total", "counter", "Requests that did not start a full fetch worker", snapshot.workers_suppressed);
    push_metric(&mut out, "workers_completed_total", "counter", "Full fetch workers that completed an entry", snapshot.workers_completed);
    push_metric(&mut out, "workers_failed_total", "counter", "Full fetch workers that stopped without completing", snapshot.workers_failed);
    push_metric(&mut out, "workers_active", "gauge", "Full fetch workers in flight", snapshot.workers_active());

    push_metric(&mut out, "bytes_from_origin_total", "counter", "Total bytes received from origin", snapshot.bytes_from_origin);
    push_metric(&mut out, "bytes_from_cache_total", "counter", "Total bytes read from the cache", snapshot.bytes_from_cache);
    push_metric(&mut out, "bytes_to_client_total", "counter", "Total bytes sent to clients", snapshot.bytes_to_client);

    push_metric(
        &mut out,
        "request_duration_ms_avg",
        "gauge",
        "Average time to response headers in milliseconds",
        format!("{:.2}", snapshot.avg_request_duration_ms()),
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = ProxyMetrics::new();

        metrics.record_request(true);
        metrics.record_request(false);
        metrics.record_request(false);
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_tee_stream(true);
        metrics.record_worker_started();
        metrics.record_worker_suppressed();
        metrics.record_bytes_from_origin(1000);
        metrics.record_bytes_from_cache(500);
        metrics.record_bytes_to_client(1500);

        let output = format_prometheus_metrics(&metrics.get_stats());

        assert!(output.contains("preview_cache_requests_total 3"));
        assert!(output.contains("preview_cache_range_requests_total 1"));
        assert!(output.contains("preview_cache_cache_hits_total 1"));
        assert!(output.contains("preview_cache_cache_misses_total 1"));
        assert!(output.contains("preview_cache_tee_cached_streams_total 1"));
        assert!(output.contains("preview_cache_workers_started_total 1"));
        assert!(output.contains("preview_cache_workers_suppressed_total 1"));
        assert!(output.contains("preview_cache_workers_active 1"));
        assert!(output.contains("preview_cache_bytes_from_origin_total 1000"));
        assert!(output.contains("preview_cache_bytes_from_cache_total 500"));
        assert!(output.contains("preview_cache_bytes_to_client_total 1500"));

        assert!(output.contains("# HELP preview_cache_requests_total"));
        assert!(output.contains("# TYPE preview_cache_requests_total counter"));
        assert!(output.contains("# TYPE preview_cache_cache_hit_rate gauge"));
    }

    #[test]
    fn test_format_prometheus_metrics_empty() {
        let output = format_prometheus_metrics(&ProxyMetrics::new().get_stats());

        assert!(output.contains("preview_cache_requests_total 0"));
        assert!(output.contains("preview_cache_cache_hit_rate 0.00"));
        assert!(output.contains("preview_cache_request_duration_ms_avg 0.00"));
    }

    #[test]
    fn test_format_prometheus_metrics_calculated_values() {
        let metrics = ProxyMetrics::new();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();

        let output = format_prometheus_metrics(&metrics.get_stats());
        assert!(output.contains("preview_cache_cache_hit_rate 75.00"));
    }

    #[test]
    fn test_text_response() {
        let response = text_response(StatusCode::NOT_FOUND, "text/plain", "nope".to_string());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
    }
}
