use std::time::Duration;

use thiserror::Error;
use url::ParseError;

/// Error types for the drover engine
#[derive(Error, Debug)]
pub enum Error {
    /// Error when parsing a URL
    #[error("URL parse error: {0}")]
    UrlParse(#[from] ParseError),

    /// The user request handler returned an error
    #[error("request handler failed: {0}")]
    Handler(String),

    /// The user request handler did not settle within the configured timeout
    #[error("request handler timed out after {0:?}")]
    HandlerTimeout(Duration),

    /// A queue, list or key-value store operation failed
    #[error("storage error: {0}")]
    Storage(String),

    /// The remote storage backend answered with a non-success status
    #[error("remote storage error: status {status}: {message}")]
    RemoteStorage {
        /// HTTP status code
        status: u16,
        /// Error message returned by the backend
        message: String,
    },

    /// HTTP transport failure while talking to a remote collaborator
    #[error("transport error: {0}")]
    Transport(String),

    /// A browser instance failed to launch
    #[error("browser launch failed: {0}")]
    BrowserLaunch(String),

    /// A page operation failed or the page's instance is gone
    #[error("browser page error: {0}")]
    BrowserPage(String),

    /// Missing collaborators or contradictory options at construction
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The operation was aborted through a cancellation signal
    #[error("operation cancelled")]
    Cancelled,

    /// The crawler can no longer reason about its own state
    #[error("crawler entered an unknown state: {0}")]
    UnknownState(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serde error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Create a new handler error
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Create a new storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a new transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a new browser launch error
    pub fn browser_launch(message: impl Into<String>) -> Self {
        Self::BrowserLaunch(message.into())
    }

    /// Create a new unknown-state error
    pub fn unknown_state(message: impl Into<String>) -> Self {
        Self::UnknownState(message.into())
    }

    /// Whether the error counts against a request's retry budget.
    ///
    /// Cancellation never does; infrastructure errors that corrupt shared
    /// state terminate the crawl instead of being retried.
    pub fn counts_as_retry(&self) -> bool {
        matches!(
            self,
            Self::Handler(_)
                | Self::HandlerTimeout(_)
                | Self::BrowserLaunch(_)
                | Self::BrowserPage(_)
                | Self::Transport(_)
        )
    }

    /// Whether a remote storage operation may be retried after a delay
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::RemoteStorage { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Result type for drover operations
pub type Result<T> = std::result::Result<T, Error>;
