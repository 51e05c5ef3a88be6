//! # Remote Stream Proxy
//!
//! Upstream side of the `/proxy` endpoint: validates the target URL, opens
//! the upstream request with the caller's `Range` and `User-Agent`, and
//! hands back the response headers plus a byte stream so the body can be
//! relayed without being buffered.
//!
//! Only the wait for the upstream response headers is bounded. Once
//! streaming has started the transfer may run as long as the client reads.

use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE, USER_AGENT};
use reqwest::Url;
use thiserror::Error;

pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(25);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid url: {0}")]
    InvalidUrl(String),
    #[error("Unsupported scheme '{0}', only http and https are allowed")]
    UnsupportedScheme(String),
    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("Upstream did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Upstream returned status {0}")]
    UpstreamStatus(u16),
}

impl ProxyError {
    /// HTTP status to report to the caller: 400 for bad input, 502 for an
    /// unreachable or slow upstream, the upstream's own status otherwise.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::InvalidUrl(_) | ProxyError::UnsupportedScheme(_) => 400,
            ProxyError::Upstream(_) | ProxyError::Timeout(_) => 502,
            ProxyError::UpstreamStatus(code) => *code,
        }
    }
}

/// Parses `raw` and accepts only absolute http(s) URLs.
pub fn validate_proxy_url(raw: &str) -> Result<Url, ProxyError> {
    let url = Url::parse(raw.trim()).map_err(|e| ProxyError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ProxyError::UnsupportedScheme(other.to_string())),
    }
}

/// Content type implied by the URL path's extension.
pub fn guess_content_type(url: &Url) -> &'static str {
    let path = url.path().to_ascii_lowercase();
    let extension = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
    match extension {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "ogg" | "ogv" => "video/ogg",
        "m3u8" => "application/vnd.apple.mpegurl",
        "mpd" => "application/dash+xml",
        _ => "application/octet-stream",
    }
}

/// Request headers relayed to the upstream.
#[derive(Debug, Clone, Default)]
pub struct ForwardHeaders {
    pub range: Option<String>,
    pub user_agent: Option<String>,
}

/// An upstream response whose body has not been read yet.
#[derive(Debug)]
pub struct UpstreamStream {
    pub status: u16,
    pub content_type: String,
    pub content_range: Option<String>,
    pub content_length: Option<String>,
    pub accept_ranges: String,
    response: reqwest::Response,
}

impl UpstreamStream {
    pub fn into_body_stream(self) -> impl Stream<Item = Result<Bytes, reqwest::Error>> {
        self.response.bytes_stream()
    }
}

#[derive(Debug, Clone)]
pub struct StreamProxy {
    client: reqwest::Client,
    timeout: Duration,
}

impl StreamProxy {
    pub fn new(timeout: Duration) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }

    pub async fn fetch(&self, url: &Url, forward: &ForwardHeaders) -> Result<UpstreamStream, ProxyError> {
        let mut request = self.client.get(url.clone());
        if let Some(range) = &forward.range {
            request = request.header(RANGE, range);
        }
        if let Some(agent) = &forward.user_agent {
            request = request.header(USER_AGENT, agent);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ProxyError::Timeout(self.timeout))??;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::UpstreamStatus(status.as_u16()));
        }

        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(CONTENT_TYPE).unwrap_or_else(|| guess_content_type(url).to_string());
        let content_range = header(CONTENT_RANGE);
        let content_length = header(CONTENT_LENGTH);
        let accept_ranges = header(ACCEPT_RANGES).unwrap_or_else(|| "bytes".to_string());

        Ok(UpstreamStream {
            status: status.as_u16(),
            content_type,
            content_range,
            content_length,
            accept_ranges,
            response,
        })
    }
}
