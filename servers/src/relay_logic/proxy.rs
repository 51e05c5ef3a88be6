use crate::relay_logic::state::AppState;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use lib_common::retrieve::{ForwardHeaders, ProxyError, validate_proxy_url};
use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct ProxyQuery {
    pub url: Option<String>,
}

/// Maps a proxy failure to a status and a short text body.
#[derive(Debug)]
pub struct ProxyFailure(pub ProxyError);

impl From<ProxyError> for ProxyFailure {
    fn from(e: ProxyError) -> Self {
        ProxyFailure(e)
    }
}

impl IntoResponse for ProxyFailure {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
        match &self.0 {
            ProxyError::InvalidUrl(_) | ProxyError::UnsupportedScheme(_) => {
                log::debug!("Rejected proxy request: {}", self.0)
            }
            _ => log::warn!("Proxy upstream failure: {}", self.0),
        }
        (status, self.0.to_string()).into_response()
    }
}

/// `GET /proxy?url=...`: relays a remote video with range support.
pub async fn proxy_handler(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
) -> Result<Response, ProxyFailure> {
    let raw = query
        .url
        .ok_or_else(|| ProxyError::InvalidUrl("missing url parameter".to_string()))?;
    let url = validate_proxy_url(&raw)?;

    let header_text = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let forward = ForwardHeaders {
        range: header_text(header::RANGE),
        user_agent: header_text(header::USER_AGENT),
    };

    let upstream = state.proxy.fetch(&url, &forward).await?;
    log::debug!("Proxying {} ({})", url, upstream.status);

    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK);
    let mut response_headers = HeaderMap::new();
    let mut set = |name: HeaderName, value: &str| {
        if let Ok(value) = HeaderValue::from_str(value) {
            response_headers.insert(name, value);
        }
    };
    set(header::CONTENT_TYPE, &upstream.content_type);
    set(header::ACCEPT_RANGES, &upstream.accept_ranges);
    if let Some(range) = &upstream.content_range {
        set(header::CONTENT_RANGE, range);
    }
    if let Some(length) = &upstream.content_length {
        set(header::CONTENT_LENGTH, length);
    }
    set(HeaderName::from_static("cross-origin-resource-policy"), "cross-origin");

    let body = Body::from_stream(upstream.into_body_stream());
    Ok((status, response_headers, body).into_response())
}
