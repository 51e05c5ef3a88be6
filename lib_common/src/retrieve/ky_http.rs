//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest` with exponential
//! backoff retries on transient failures and standardized JSON handling.

use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 3;

/// The outcome of one request.
///
/// `data` is only filled for 2xx responses whose body parses as `T`;
/// the raw body text is always kept.
#[derive(Debug)]
pub struct ApiResponse<T> {
    pub data: Option<T>,
    pub body: String,
    pub status: u16,
    pub success: bool,
    pub headers: HeaderMap,
}

/// A middleware-enabled client bound to one base URL.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a client with a three-retry exponential backoff policy.
    ///
    /// # Errors
    /// Fails when `base_url` is not an absolute URL or the TLS backend
    /// cannot be initialised.
    pub fn new(base_url: &str, auth_token: Option<String>) -> anyhow::Result<Self> {
        Self::with_timeout(base_url, auth_token, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, auth_token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let url = Url::parse(base_url)?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_RETRIES);
        let client = ClientBuilder::new(reqwest::Client::builder().timeout(timeout).build()?)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            base_url: url,
            auth_token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Performs a request relative to the base URL.
    ///
    /// Non-2xx statuses are not errors; inspect [`ApiResponse::success`].
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<&B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let full_url = self.base_url.join(path)?;
        let mut req = self.inner.request(method, full_url);

        if let Some(h) = headers {
            req = req.headers(h);
        }
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(b) = body {
            req = req
                .header(CONTENT_TYPE, "application/json")
                .body(serde_json::to_string(b)?);
        }

        let response = req.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        let data = if status.is_success() {
            serde_json::from_str(&body).ok()
        } else {
            None
        };

        Ok(ApiResponse {
            data,
            body,
            status: status.as_u16(),
            success: status.is_success(),
            headers,
        })
    }

    /// POSTs `body` as JSON and fails on a non-2xx status.
    pub async fn post_json<B>(&self, path: &str, body: &B) -> anyhow::Result<ApiResponse<serde_json::Value>>
    where
        B: Serialize + ?Sized,
    {
        let response = self.request(Method::POST, path, None, Some(body)).await?;
        if !response.success {
            anyhow::bail!(
                "POST {} returned {}: {}",
                self.base_url.join(path)?,
                response.status,
                response.body.chars().take(200).collect::<String>()
            );
        }
        Ok(response)
    }
}
