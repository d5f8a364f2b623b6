use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use drover_core::error::{Error, Result};
use drover_core::request::Request;

use crate::request_queue::{AddRequestResult, RequestQueue};

#[derive(Default)]
struct Inner {
    requests: HashMap<String, Request>,
    pending: VecDeque<String>,
    in_progress: HashSet<String>,
    handled: HashSet<String>,
}

/// In-process request queue.
///
/// The reference implementation of the queue contract; one mutex
/// serializes all state transitions, which also gives forefront inserts
/// their visible-only-to-subsequent-fetches semantics.
#[derive(Default)]
pub struct MemoryRequestQueue {
    inner: Mutex<Inner>,
}

impl MemoryRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestQueue for MemoryRequestQueue {
    async fn add_request(&self, request: Request, forefront: bool) -> Result<AddRequestResult> {
        let mut inner = self.inner.lock().await;
        let key = request.unique_key.clone();

        if inner.requests.contains_key(&key) {
            return Ok(AddRequestResult {
                was_already_handled: inner.handled.contains(&key),
                was_already_present: true,
                request_id: key,
            });
        }

        inner.requests.insert(key.clone(), request);
        if forefront {
            inner.pending.push_front(key.clone());
        } else {
            inner.pending.push_back(key.clone());
        }
        Ok(AddRequestResult {
            request_id: key,
            was_already_present: false,
            was_already_handled: false,
        })
    }

    async fn fetch_next_request(&self) -> Result<Option<Request>> {
        let mut inner = self.inner.lock().await;
        let key = match inner.pending.pop_front() {
            Some(key) => key,
            None => return Ok(None),
        };
        inner.in_progress.insert(key.clone());
        let request = inner
            .requests
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::storage(format!("queue lost request {}", key)))?;
        Ok(Some(request))
    }

    async fn mark_request_handled(&self, request: &Request) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let key = &request.unique_key;
        if !inner.in_progress.remove(key) {
            return Err(Error::storage(format!(
                "cannot mark request {} handled: not in progress",
                key
            )));
        }
        inner.handled.insert(key.clone());
        if let Some(stored) = inner.requests.get_mut(key) {
            *stored = request.clone();
            if stored.handled_at.is_none() {
                stored.handled_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn reclaim_request(&self, request: &Request, forefront: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let key = &request.unique_key;
        if !inner.in_progress.remove(key) {
            return Err(Error::storage(format!(
                "cannot reclaim request {}: not in progress",
                key
            )));
        }
        inner.requests.insert(key.clone(), request.clone());
        if forefront {
            inner.pending.push_front(key.clone());
        } else {
            inner.pending.push_back(key.clone());
        }
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.inner.lock().await.pending.is_empty())
    }

    async fn is_finished(&self) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.pending.is_empty() && inner.in_progress.is_empty())
    }

    async fn handled_count(&self) -> Result<u64> {
        Ok(self.inner.lock().await.handled.len() as u64)
    }
}
