//! Client-wide defaults and per-call overrides.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{Error, ErrorKind, Result};
use crate::http::{RetryPolicy, Timeout};

/// Default API root.
pub const BASE_API_URL: &str = "https://cloud-api.yandex.net";

/// Default connect/read timeout pair.
pub const DEFAULT_TIMEOUT: Timeout = Timeout::new(Duration::from_secs(10), Duration::from_secs(15));

/// Client-wide configuration, fixed at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub base_url: String,
    /// Timeouts the sessions are built with.
    pub timeout: Timeout,
    pub n_retries: u32,
    pub retry_interval: Duration,
    /// Per-attempt timeout for uploads, when different from `timeout`.
    pub upload_timeout: Option<Timeout>,
    pub upload_retry_interval: Duration,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: BASE_API_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            n_retries: crate::http::DEFAULT_RETRIES,
            retry_interval: Duration::ZERO,
            upload_timeout: None,
            upload_retry_interval: Duration::ZERO,
            user_agent: concat!("yadisk-rs/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn n_retries(mut self, n_retries: u32) -> Self {
        self.n_retries = n_retries;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn upload_timeout(mut self, timeout: Timeout) -> Self {
        self.upload_timeout = Some(timeout);
        self
    }

    pub fn upload_retry_interval(mut self, interval: Duration) -> Self {
        self.upload_retry_interval = interval;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Absolute URL for an API path such as `/v1/disk/resources`.
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Per-call overrides. Unset fields fall back to [`Settings`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub n_retries: Option<u32>,
    pub retry_interval: Option<Duration>,
    pub retry_on: Vec<ErrorKind>,
    pub headers: HeaderMap,
    pub timeout: Option<Timeout>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n_retries(mut self, n_retries: u32) -> Self {
        self.n_retries = Some(n_retries);
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on.extend(kinds);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidRequest(format!("invalid header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidRequest(format!("invalid value for header {}: {}", name, e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry policy for an ordinary API call.
    pub fn policy(&self, settings: &Settings) -> RetryPolicy {
        RetryPolicy {
            n_retries: self.n_retries.unwrap_or(settings.n_retries),
            interval: self.retry_interval.unwrap_or(settings.retry_interval),
            retry_on: self.retry_on.clone(),
        }
    }

    /// Retry policy for a content upload.
    pub fn upload_policy(&self, settings: &Settings) -> RetryPolicy {
        RetryPolicy {
            n_retries: self.n_retries.unwrap_or(settings.n_retries),
            interval: self.retry_interval.unwrap_or(settings.upload_retry_interval),
            retry_on: self.retry_on.clone(),
        }
    }

    /// Timeout override for a content upload.
    pub fn upload_timeout(&self, settings: &Settings) -> Option<Timeout> {
        self.timeout.or(settings.upload_timeout)
    }
}
