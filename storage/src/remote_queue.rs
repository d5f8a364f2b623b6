//! Remote HTTP request queue backend.
//!
//! The remote store is eventually consistent: a freshly added request may
//! not be visible to an immediately following head read. The client keeps
//! a bounded cache of recently added identifiers and a head estimate of
//! the pending count; when the backend reports an empty head while the
//! estimate says otherwise, the read is retried with bounded exponential
//! backoff before giving up.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use log::{debug, warn};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;

use drover_core::error::{Error, Result};
use drover_core::request::Request;

use crate::request_queue::{AddRequestResult, RequestQueue};

/// Options for [`RemoteRequestQueue`]
#[derive(Clone)]
pub struct RemoteQueueOptions {
    /// Base URL of the storage API, e.g. `https://storage.example.com`
    pub base_url: String,
    /// Queue identifier
    pub queue_id: String,
    /// Bearer token, sent when set
    pub token: Option<String>,
    /// Capacity of the recently-added identifier cache
    pub cache_size: usize,
    /// Budget for retrying head reads that lag behind writes
    pub max_read_lag_wait: Duration,
    /// Invoked whenever the backend rate-limits a call; wired to the
    /// snapshotter's client-overload input by the crawler
    pub on_rate_limited: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl RemoteQueueOptions {
    pub fn new(base_url: impl Into<String>, queue_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            queue_id: queue_id.into(),
            token: None,
            cache_size: 1000,
            max_read_lag_wait: Duration::from_secs(10),
            on_rate_limited: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueStats {
    pending_count: u64,
    in_progress_count: u64,
    handled_count: u64,
}

struct RecentCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, AddRequestResult>,
}

impl RecentCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn get(&self, key: &str) -> Option<&AddRequestResult> {
        self.entries.get(key)
    }

    fn insert(&mut self, key: String, value: AddRequestResult) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
            while self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }
}

/// Request queue talking to a remote HTTP storage backend
pub struct RemoteRequestQueue {
    client: Client,
    opts: RemoteQueueOptions,
    recent: Mutex<RecentCache>,
    head_estimate: AtomicI64,
}

impl RemoteRequestQueue {
    pub fn new(opts: RemoteQueueOptions) -> Result<Self> {
        if opts.base_url.is_empty() || opts.queue_id.is_empty() {
            return Err(Error::configuration(
                "remote queue needs a base URL and a queue id",
            ));
        }
        let client = Client::builder()
            .build()
            .map_err(|e| Error::transport(e.to_string()))?;
        let cache_size = opts.cache_size;
        Ok(Self {
            client,
            opts,
            recent: Mutex::new(RecentCache::new(cache_size)),
            head_estimate: AtomicI64::new(0),
        })
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!(
            "{}/v2/queues/{}{}",
            self.opts.base_url.trim_end_matches('/'),
            self.opts.queue_id,
            suffix
        )
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.opts.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            if let Some(callback) = &self.opts.on_rate_limited {
                callback();
            }
        }
        let message = response.text().await.unwrap_or_default();
        Err(Error::RemoteStorage {
            status: status.as_u16(),
            message,
        })
    }

    async fn stats(&self) -> Result<QueueStats> {
        let response = self
            .authorize(self.client.get(self.endpoint("")))
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;
        let response = self.check(response).await?;
        let stats: QueueStats = response
            .json()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;
        self.head_estimate
            .store(stats.pending_count as i64, Ordering::SeqCst);
        Ok(stats)
    }

    async fn fetch_head_once(&self) -> Result<Option<Request>> {
        let response = self
            .authorize(self.client.post(self.endpoint("/head")))
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;
        let response = self.check(response).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let request: Request = response
            .json()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;
        Ok(Some(request))
    }
}

#[async_trait]
impl RequestQueue for RemoteRequestQueue {
    async fn add_request(&self, request: Request, forefront: bool) -> Result<AddRequestResult> {
        {
            let recent = self.recent.lock().await;
            if let Some(cached) = recent.get(&request.unique_key) {
                // Read-your-writes: the backend already knows this one.
                let mut result = cached.clone();
                result.was_already_present = true;
                return Ok(result);
            }
        }

        let response = self
            .authorize(
                self.client
                    .post(self.endpoint("/requests"))
                    .query(&[("forefront", forefront)])
                    .json(&request),
            )
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;
        let response = self.check(response).await?;
        let result: AddRequestResult = response
            .json()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;

        if !result.was_already_present {
            self.head_estimate.fetch_add(1, Ordering::SeqCst);
        }
        self.recent
            .lock()
            .await
            .insert(request.unique_key.clone(), result.clone());
        Ok(result)
    }

    async fn fetch_next_request(&self) -> Result<Option<Request>> {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_elapsed_time(Some(self.opts.max_read_lag_wait))
            .build();

        loop {
            if let Some(request) = self.fetch_head_once().await? {
                if self.head_estimate.fetch_sub(1, Ordering::SeqCst) <= 0 {
                    self.head_estimate.store(0, Ordering::SeqCst);
                }
                return Ok(Some(request));
            }

            if self.head_estimate.load(Ordering::SeqCst) <= 0 {
                return Ok(None);
            }
            // The write may not be visible yet; refresh the estimate and
            // retry within the backoff budget.
            let stats = self.stats().await?;
            if stats.pending_count == 0 {
                return Ok(None);
            }
            match backoff.next_backoff() {
                Some(delay) => {
                    debug!(
                        "queue head lags behind {} pending, retrying in {:?}",
                        stats.pending_count, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(
                        "queue head still empty after {:?} with {} pending",
                        self.opts.max_read_lag_wait, stats.pending_count
                    );
                    return Ok(None);
                }
            }
        }
    }

    async fn mark_request_handled(&self, request: &Request) -> Result<()> {
        let response = self
            .authorize(
                self.client
                    .post(self.endpoint(&format!("/requests/{}/handled", request.unique_key)))
                    .json(request),
            )
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;
        self.check(response).await?;
        if let Some(cached) = self.recent.lock().await.entries.get_mut(&request.unique_key) {
            cached.was_already_handled = true;
        }
        Ok(())
    }

    async fn reclaim_request(&self, request: &Request, forefront: bool) -> Result<()> {
        let response = self
            .authorize(
                self.client
                    .post(self.endpoint(&format!("/requests/{}/reclaim", request.unique_key)))
                    .query(&[("forefront", forefront)])
                    .json(request),
            )
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;
        self.check(response).await?;
        self.head_estimate.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.stats().await?.pending_count == 0)
    }

    async fn is_finished(&self) -> Result<bool> {
        let stats = self.stats().await?;
        Ok(stats.pending_count == 0 && stats.in_progress_count == 0)
    }

    async fn handled_count(&self) -> Result<u64> {
        Ok(self.stats().await?.handled_count)
    }
}
