use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::unique_key::compute_unique_key;

/// Hard cap on stored error messages per request, to bound memory on
/// requests that fail many times.
pub const MAX_ERROR_MESSAGES: usize = 10;

/// HTTP methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Method {
    #[default]
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
}

impl Method {
    /// Canonical uppercase name of the method
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
        }
    }
}

/// A single unit of crawling work: one URL to fetch and process.
///
/// The unique key identifies the request across queues and restarts;
/// everything else is payload. Retry bookkeeping (`retry_count`,
/// `error_messages`, `no_retry`) is owned by the scheduler; user handlers
/// may read it but should not mutate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Stable identifier; equality defines deduplication
    pub unique_key: String,

    /// The URL to request
    pub url: Url,

    /// The HTTP method to use
    #[serde(default)]
    pub method: Method,

    /// HTTP headers to include
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body (for POST, PUT, etc.)
    #[serde(default)]
    pub payload: Option<Vec<u8>>,

    /// Arbitrary user metadata carried with the request
    #[serde(default)]
    pub user_data: HashMap<String, serde_json::Value>,

    /// How many times handling has been retried so far
    #[serde(default)]
    pub retry_count: u32,

    /// Messages of handler errors, in order of occurrence
    #[serde(default)]
    pub error_messages: Vec<String>,

    /// When set, the request is never retried after a failure
    #[serde(default)]
    pub no_retry: bool,

    /// Final URL after redirects, set after handling
    #[serde(default)]
    pub loaded_url: Option<Url>,

    /// When the request was marked handled
    #[serde(default)]
    pub handled_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Create a new GET request
    pub fn get<U: AsRef<str>>(url: U) -> Result<Self> {
        let url = Url::parse(url.as_ref()).map_err(Error::UrlParse)?;
        Ok(Self::from_parts(url, Method::GET, None))
    }

    /// Create a new POST request
    pub fn post<U: AsRef<str>, B: Into<Vec<u8>>>(url: U, payload: B) -> Result<Self> {
        let url = Url::parse(url.as_ref()).map_err(Error::UrlParse)?;
        Ok(Self::from_parts(url, Method::POST, Some(payload.into())))
    }

    fn from_parts(url: Url, method: Method, payload: Option<Vec<u8>>) -> Self {
        let unique_key = compute_unique_key(&url, method, payload.as_deref());
        Self {
            unique_key,
            url,
            method,
            headers: HashMap::new(),
            payload,
            user_data: HashMap::new(),
            retry_count: 0,
            error_messages: Vec::new(),
            no_retry: false,
            loaded_url: None,
            handled_at: None,
        }
    }

    /// Override the computed unique key
    pub fn with_unique_key<K: Into<String>>(mut self, unique_key: K) -> Self {
        self.unique_key = unique_key.into();
        self
    }

    /// Add a header to the request
    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Add user metadata to the request
    pub fn with_user_data<K: Into<String>, V: Into<serde_json::Value>>(
        mut self,
        key: K,
        value: V,
    ) -> Self {
        self.user_data.insert(key.into(), value.into());
        self
    }

    /// Mark the request as not retryable
    pub fn with_no_retry(mut self, no_retry: bool) -> Self {
        self.no_retry = no_retry;
        self
    }

    /// Append a handler error message, keeping at most
    /// [`MAX_ERROR_MESSAGES`] entries.
    pub fn push_error_message(&mut self, message: impl Into<String>) {
        if self.error_messages.len() < MAX_ERROR_MESSAGES {
            self.error_messages.push(message.into());
        }
    }

    /// Stamp the request as handled now
    pub fn mark_handled(&mut self) {
        self.handled_at = Some(Utc::now());
    }

    /// Whether the request has been marked handled
    pub fn is_handled(&self) -> bool {
        self.handled_at.is_some()
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.unique_key == other.unique_key
    }
}

impl Eq for Request {}

impl Hash for Request {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique_key.hash(state);
    }
}
