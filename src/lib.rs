//! Preview Cache
//!
//! A caching streaming proxy for remote media. Clients ask for a resource URL;
//! the proxy serves it from a local disk cache when a complete copy exists and
//! streams it from origin otherwise, populating the cache in the background.
//!
//! # Overview
//!
//! Each resource URL maps to one data file and one completion marker in the
//! cache directory. A request is handled in one of two ways:
//!
//! - **Complete entry**: the [`RangeCacheReader`] serves the file, honoring
//!   single `bytes=start-end` ranges with 206 responses.
//! - **Anything else**: a [`FullFetchWorker`] is started for the key unless one
//!   is already in flight, and the current client is served by the
//!   [`TeeStreamer`], which copies origin bytes into the cache as it streams.
//!
//! At most one writer ever appends to a data file. The tee claims the writer
//! only when it is free; the worker always takes it over and continues from
//! the last byte the tee wrote. See [`population`] for the details.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use preview_cache::{PreviewProxy, ProxyConfig, StreamRequest};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProxyConfig::from_file("preview_cache.yaml")?;
//! let proxy = PreviewProxy::new(Arc::new(config))?;
//!
//! let request = StreamRequest::new("https://cdn.example.com/v/1.mp4", "Mozilla/5.0", "Trailer")
//!     .with_range("bytes=0-1023");
//! let response = proxy.handle(&request).await?;
//! println!("status: {}", response.status);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! ```yaml
//! listen_address: "0.0.0.0:5000"
//! cache_dir: "/var/cache/preview"
//! stream_chunk_size: 524288      # 512KB
//! fetch_chunk_size: 2097152      # 2MB
//! origin_timeout_secs: 10
//! max_cache_bytes: 10737418240   # stop admitting new entries at 10GB
//! credentials_file: "login_creds.json"
//! ```
//!
//! See [`ProxyConfig`] for every option.
//!
//! # Error Handling
//!
//! All fallible operations return [`ProxyError`]. Errors that reach a client
//! are mapped with [`ProxyError::to_http_status`]:
//!
//! ```rust,no_run
//! use preview_cache::{ProxyConfig, ProxyError};
//!
//! # fn main() {
//! match ProxyConfig::from_file("config.yaml") {
//!     Ok(_) => println!("Config loaded successfully"),
//!     Err(ProxyError::ConfigError(msg)) => eprintln!("Config error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

pub mod cache_key;
pub mod config;
pub mod error;
pub mod full_fetch;
pub mod metrics;
pub mod metrics_endpoint;
pub mod models;
pub mod origin;
pub mod population;
pub mod proxy;
pub mod range_reader;
pub mod resolver;
pub mod server;
pub mod supervisor;
pub mod tee_streamer;

// Re-export commonly used types
pub use cache_key::{CacheKey, CacheLayout, CachePaths};
pub use config::{MetricsEndpointConfig, ProxyConfig};
pub use error::{ProxyError, Result};
pub use full_fetch::{FetchJob, FullFetchWorker};
pub use metrics::{MetricsSnapshot, ProxyMetrics};
pub use metrics_endpoint::MetricsEndpoint;
pub use models::{ByteRange, PopulationState, ProxyResponse, RangeRequest, RangeSpec, StreamRequest};
pub use origin::{OriginClient, OriginRequest};
pub use population::PopulationRegistry;
pub use proxy::PreviewProxy;
pub use range_reader::RangeCacheReader;
pub use resolver::{CredentialStore, Credentials, DirectMediaResolver, MetadataResolver, ResolvedMedia};
pub use server::AppState;
pub use supervisor::{WorkerReport, WorkerSupervisor};
pub use tee_streamer::{TeeStream, TeeStreamer};
