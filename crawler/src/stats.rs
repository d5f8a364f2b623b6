// Crawl statistics

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Counters for one crawl run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlerStats {
    /// Requests handled successfully
    pub requests_handled: u64,

    /// Requests that exhausted their retry budget
    pub requests_failed: u64,

    /// Total retry reclaims
    pub retries: u64,

    /// Start time of the crawl
    #[serde(skip)]
    pub start_time: Option<Instant>,

    /// End time of the crawl
    #[serde(skip)]
    pub end_time: Option<Instant>,
}

impl CrawlerStats {
    /// Requests finished one way or the other
    pub fn requests_finished(&self) -> u64 {
        self.requests_handled + self.requests_failed
    }

    /// Duration of the crawl so far, or of the whole run once finished
    pub fn duration(&self) -> Option<Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end.duration_since(start)),
            (Some(start), None) => Some(Instant::now().duration_since(start)),
            _ => None,
        }
    }

    /// Finished requests per second
    pub fn requests_per_second(&self) -> Option<f64> {
        self.duration().map(|duration| {
            let seconds = duration.as_secs_f64();
            if seconds > 0.0 {
                self.requests_finished() as f64 / seconds
            } else {
                0.0
            }
        })
    }
}
