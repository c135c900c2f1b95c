//! HTTP front
//!
//! Routes:
//!
//! | method  | path       | action                                        |
//! |---------|------------|-----------------------------------------------|
//! | GET     | `/preview` | stream `video_url` through the cache          |
//! | POST    | `/v`       | resolve a page URL via the metadata resolver  |
//! | GET     | `/health`  | liveness                                      |
//! | GET     | `/metrics` | Prometheus text                               |
//! | OPTIONS | any        | CORS preflight                                |
//!
//! Every response carries `Access-Control-Allow-Origin: *`.

use crate::error::{ProxyError, Result};
use crate::metrics_endpoint::{format_prometheus_metrics, PROMETHEUS_CONTENT_TYPE};
use crate::models::{ProxyResponse, StreamRequest};
use crate::proxy::PreviewProxy;
use crate::resolver::{CredentialStore, MetadataResolver};
use bytes::Bytes;
use futures::TryStreamExt;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited, StreamBody};
use hyper::body::{Body, Frame};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

/// Response body type produced by every route
pub type ResponseBody = UnsyncBoxBody<Bytes, ProxyError>;

/// Largest accepted `/v` request body
const MAX_JSON_BODY: usize = 64 * 1024;

/// Shared state handed to every connection
#[derive(Clone)]
pub struct AppState {
    proxy: PreviewProxy,
    resolver: Option<Arc<dyn MetadataResolver>>,
    credentials: Arc<CredentialStore>,
}

impl AppState {
    pub fn new(proxy: PreviewProxy) -> Self {
        AppState {
            proxy,
            resolver: None,
            credentials: Arc::new(CredentialStore::default()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn MetadataResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialStore) -> Self {
        self.credentials = Arc::new(credentials);
        self
    }

    pub fn proxy(&self) -> &PreviewProxy {
        &self.proxy
    }
}

/// Accept connections until `shutdown` fires
///
/// Connections already accepted keep running until their responses finish.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Preview server listening on http://{}", addr);

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Preview server on {} stopped accepting connections", addr);
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let state = state.clone();
        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone()));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Connection from {} ended with error: {:?}", peer, err);
            }
        });
    }
}

/// Route one request
pub async fn handle_request<B>(
    req: Request<B>,
    state: AppState,
) -> std::result::Result<Response<ResponseBody>, Infallible>
where
    B: Body + Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    debug!("{} {}", req.method(), req.uri());

    let mut response = match (req.method(), req.uri().path()) {
        (&Method::OPTIONS, _) => preflight_response(),
        (&Method::GET, "/preview") => preview(req, &state).await,
        (&Method::POST, "/v") => resolve_info(req, &state).await,
        (&Method::GET, "/health") => json_response(StatusCode::OK, serde_json::json!({"status": "healthy"})),
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&state.proxy.metrics().get_stats());
            let mut response = full_response(StatusCode::OK, body);
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE));
            response
        }
        (_, "/preview" | "/v" | "/health" | "/metrics") => {
            text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
        }
        _ => text_response(StatusCode::NOT_FOUND, "Not found"),
    };

    response
        .headers_mut()
        .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    Ok(response)
}

async fn preview<B>(req: Request<B>, state: &AppState) -> Response<ResponseBody> {
    let config = state.proxy.config();

    let mut video_url = None;
    let mut title = None;
    for (key, value) in form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes()) {
        match key.as_ref() {
            "video_url" if !value.is_empty() => video_url = Some(value.into_owned()),
            "filename" if !value.is_empty() => title = Some(value.into_owned()),
            _ => {}
        }
    }
    let Some(video_url) = video_url else {
        return error_response(&ProxyError::InvalidRequest(
            "missing video_url parameter".to_string(),
        ));
    };

    let headers = req.headers();
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(&config.default_user_agent);
    let title = title.unwrap_or_else(|| config.default_title.clone());

    let mut request = StreamRequest::new(video_url, user_agent, title);
    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        request = request.with_range(range);
    }

    match state.proxy.handle(&request).await {
        Ok(response) => stream_response(response),
        Err(e) => error_response(&e),
    }
}

async fn resolve_info<B>(req: Request<B>, state: &AppState) -> Response<ResponseBody>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = match Limited::new(req.into_body(), MAX_JSON_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("Failed to read /v request body: {}", e);
            return json_error(StatusCode::BAD_REQUEST, "Invalid request body");
        }
    };

    let url = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("url").and_then(|u| u.as_str()).map(str::to_string))
        .filter(|u| !u.is_empty());
    let Some(url) = url else {
        return json_error(StatusCode::BAD_REQUEST, "Please enter url");
    };

    let Some(resolver) = &state.resolver else {
        return json_error(StatusCode::NOT_IMPLEMENTED, &ProxyError::ResolverUnavailable.to_string());
    };

    match resolver.resolve(&url, state.credentials.for_url(&url)).await {
        Ok(media) => {
            info!("Resolved url={} title={:?}", url, media.title);
            json_response(StatusCode::OK, media.raw_info)
        }
        Err(e) => {
            warn!("Resolver failed for url={}: {}", url, e);
            json_error(StatusCode::BAD_REQUEST, &e.to_string())
        }
    }
}

fn stream_response(proxy_response: ProxyResponse) -> Response<ResponseBody> {
    let body = StreamBody::new(proxy_response.body.map_ok(Frame::data));
    let mut response = Response::new(BodyExt::boxed_unsync(body));
    *response.status_mut() = proxy_response.status;
    *response.headers_mut() = proxy_response.headers;
    response
}

fn full_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    let body: ResponseBody = Full::new(body.into()).map_err(|never| match never {}).boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

fn text_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    let mut response = full_response(status, message.to_string());
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<ResponseBody> {
    let mut response = full_response(status, value.to_string());
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn json_error(status: StatusCode, message: &str) -> Response<ResponseBody> {
    json_response(status, serde_json::json!({ "error": message }))
}

/// Map a proxy error to a short plain-text response
pub fn error_response(err: &ProxyError) -> Response<ResponseBody> {
    let status = StatusCode::from_u16(err.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("Responding {} to client: {}", status.as_u16(), err);
    }

    let message = if err.is_origin_failure() {
        format!("Error fetching video: {}", err)
    } else {
        err.to_string()
    };
    let mut response = text_response(status, &message);

    if let ProxyError::RangeNotSatisfiable { size, .. } = err {
        if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
            response.headers_mut().insert(header::CONTENT_RANGE, value);
        }
    }
    response
}

fn preflight_response() -> Response<ResponseBody> {
    let body: ResponseBody = Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Range"),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    response
}
