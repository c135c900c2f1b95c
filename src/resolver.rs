//! Metadata resolution collaborator and per-domain credentials
//!
//! Turning a page URL into a playable stream URL is not the proxy's job; it
//! is delegated to a [`MetadataResolver`]. Credentials for resolvers are
//! loaded once at startup into an immutable [`CredentialStore`].

use crate::error::{ProxyError, Result};
use crate::origin::{OriginClient, OriginRequest};
use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};
use url::Url;

/// Login for one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Immutable map from domain (`host[:port]`) to credentials
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    by_domain: HashMap<String, Credentials>,
}

impl CredentialStore {
    /// Parse `{"<domain>": {"username": ..., "password": ...}, ...}`
    pub fn from_json(content: &str) -> Result<Self> {
        let by_domain: HashMap<String, Credentials> = serde_json::from_str(content)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to parse credentials: {}", e)))?;
        Ok(CredentialStore { by_domain })
    }

    /// Load credentials from a JSON file
    ///
    /// A missing file is not an error: the store is empty and resolvers run
    /// without logins.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let store = Self::from_json(&content)?;
                info!("Loaded credentials for {} domain(s)", store.len());
                Ok(store)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Credentials file {} not found, proceeding without login",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(ProxyError::ConfigError(format!(
                "Failed to read credentials file: {}",
                e
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.by_domain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }

    /// Credentials for the domain serving `page_url`
    pub fn for_url(&self, page_url: &str) -> Option<&Credentials> {
        let domain = domain_of(page_url)?;
        self.by_domain.get(&domain)
    }
}

/// `host[:port]` of a URL
fn domain_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// What a resolver learned about a page
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMedia {
    /// Ready-to-fetch media URL
    pub stream_url: String,
    /// Human title
    pub title: String,
    /// Everything the resolver knows, returned verbatim to API clients
    pub raw_info: serde_json::Value,
}

/// Resolves page URLs into playable media
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(
        &self,
        page_url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<ResolvedMedia>;
}

/// Resolver for URLs that already point at a media file
///
/// Probes the URL with a HEAD request and derives the title from the last
/// path segment.
pub struct DirectMediaResolver {
    origin: OriginClient,
    user_agent: String,
}

impl DirectMediaResolver {
    pub fn new(origin: OriginClient, user_agent: impl Into<String>) -> Self {
        DirectMediaResolver {
            origin,
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl MetadataResolver for DirectMediaResolver {
    async fn resolve(
        &self,
        page_url: &str,
        _credentials: Option<&Credentials>,
    ) -> Result<ResolvedMedia> {
        let request = OriginRequest::new(page_url, &self.user_agent)
            .map_err(|e| ProxyError::ResolverError(e.to_string()))?;
        let metadata = self
            .origin
            .fetch_metadata(&request)
            .await
            .map_err(|e| ProxyError::ResolverError(format!("Error while fetching video info: {}", e)))?;

        let title = title_from_url(page_url);
        let raw_info = serde_json::json!({
            "url": page_url,
            "title": title,
            "filesize": metadata.content_length,
            "content_type": metadata.content_type,
        });

        Ok(ResolvedMedia {
            stream_url: page_url.to_string(),
            title,
            raw_info,
        })
    }
}

/// Last path segment without its extension, or `video`
fn title_from_url(url: &str) -> String {
    let segment = Url::parse(url)
        .ok()
        .and_then(|u| u.path_segments()?.last().map(str::to_string))
        .unwrap_or_default();
    let decoded = percent_decode_str(&segment).decode_utf8_lossy();
    let stem = match decoded.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => &*decoded,
    };
    if stem.is_empty() {
        "video".to_string()
    } else {
        stem.to_string()
    }
}
