//! # Data Retrieval Module
//!
//! Outbound HTTP for the relay.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: a generic `ApiClient` built on `reqwest` and
//!   `reqwest-middleware`, with automatic retries and exponential backoff.
//! - **`webhook_notify`**: the notification collaborator. Posts a short
//!   alert message to a webhook through `ApiClient`.
//! - **`stream_proxy`**: the upstream half of the `/proxy` endpoint. Fetches
//!   remote video with `Range` support and a bounded wait for headers, and
//!   exposes the body as a stream.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with retry middleware.
pub mod ky_http;
/// Streaming upstream fetch for the remote video proxy.
pub mod stream_proxy;
/// Violation notifications over a webhook.
pub mod webhook_notify;

pub use ky_http::{ApiClient, ApiResponse};
pub use stream_proxy::{
    guess_content_type, validate_proxy_url, ForwardHeaders, ProxyError, StreamProxy, UpstreamStream,
    DEFAULT_PROXY_TIMEOUT,
};
pub use webhook_notify::WebhookNotifier;
