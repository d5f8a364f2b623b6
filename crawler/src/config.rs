// Configuration for the crawler core

use std::time::Duration;

use drover_autoscaling::{AutoscaledPoolOptions, SystemStatusOptions};
use drover_core::error::{Error, Result};

/// Configuration for [`Crawler`](crate::Crawler).
///
/// All knobs are explicit fields; there is no dynamic options bag.
#[derive(Clone)]
pub struct CrawlerConfig {
    /// How many times a failing request is retried before the failure
    /// handler runs
    pub max_request_retries: u32,

    /// Stop fetching new requests once this many have been handled.
    /// Tasks already in flight may overshoot slightly.
    pub max_requests_per_crawl: Option<u64>,

    /// Budget for one request handler invocation; expiry counts as a
    /// handler failure
    pub request_handler_timeout: Duration,

    /// How long a migration pause waits for in-flight tasks before
    /// persisting anyway
    pub migration_grace: Duration,

    /// Interval between emitted persist-state events
    pub persist_state_interval: Duration,

    /// Whether to log progress lines
    pub log_stats: bool,

    /// Interval between progress lines
    pub stats_interval: Duration,

    /// Concurrency controller configuration
    pub autoscaling: AutoscaledPoolOptions,

    /// Overload classification configuration
    pub system_status: SystemStatusOptions,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_request_retries: 3,
            max_requests_per_crawl: None,
            request_handler_timeout: Duration::from_secs(60),
            migration_grace: Duration::from_secs(20),
            persist_state_interval: Duration::from_secs(60),
            log_stats: true,
            stats_interval: Duration::from_secs(60),
            autoscaling: AutoscaledPoolOptions::default(),
            system_status: SystemStatusOptions::default(),
        }
    }
}

impl CrawlerConfig {
    /// Validate option consistency
    pub fn validate(&self) -> Result<()> {
        if self.request_handler_timeout.is_zero() {
            return Err(Error::configuration(
                "request_handler_timeout must be positive",
            ));
        }
        if self.max_requests_per_crawl == Some(0) {
            return Err(Error::configuration(
                "max_requests_per_crawl must be at least 1",
            ));
        }
        self.autoscaling.validate()
    }
}
