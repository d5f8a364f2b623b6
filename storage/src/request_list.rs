//! Ordered, restartable source of seed requests.
//!
//! Sources are materialized into memory in order at open time; progress
//! (`next_index`, in-progress identifiers, reclaimed requests) can be
//! persisted to a key-value store and restored on the next open, so a
//! restarted crawl resumes where it left off without re-serving handled
//! seeds.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use drover_core::error::{Error, Result};
use drover_core::request::Request;

use crate::kv::KeyValueStore;

/// Default pattern for extracting URLs out of fetched source bodies
pub const DEFAULT_URL_PATTERN: &str = r#"https?://[^\s"'<>\[\]]+"#;

/// One seed source: an inline request or a remote batch of URLs
#[derive(Debug, Clone)]
pub enum RequestListSource {
    /// A single request
    Request(Request),
    /// A URL whose body is fetched and scanned for request URLs
    RequestsFromUrl {
        /// Where to fetch the batch from
        url: String,
        /// Pattern matching one URL per occurrence; defaults to
        /// [`DEFAULT_URL_PATTERN`]
        url_pattern: Option<String>,
    },
}

/// Options for [`RequestList::open`]
#[derive(Default)]
pub struct RequestListOptions {
    /// Keep requests whose identifier was already seen during
    /// materialization instead of dropping them
    pub keep_duplicates: bool,
    /// Key under which progress state is persisted
    pub persist_state_key: Option<String>,
    /// Store for progress state; required when a key is set
    pub key_value_store: Option<Arc<dyn KeyValueStore>>,
}

/// Persisted progress of a request list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestListState {
    pub next_index: usize,
    pub in_progress: Vec<String>,
    pub reclaimed: Vec<Request>,
}

struct ListState {
    requests: Vec<Request>,
    next_index: usize,
    in_progress: HashSet<String>,
    reclaimed: VecDeque<Request>,
    handled_count: u64,
}

/// Ordered list of seed requests with restartable progress
pub struct RequestList {
    state: Mutex<ListState>,
    persist_state_key: Option<String>,
    key_value_store: Option<Arc<dyn KeyValueStore>>,
}

impl RequestList {
    /// Materialize all sources in order and restore persisted progress,
    /// if any.
    pub async fn open(
        sources: Vec<RequestListSource>,
        options: RequestListOptions,
    ) -> Result<Self> {
        if options.persist_state_key.is_some() && options.key_value_store.is_none() {
            return Err(Error::configuration(
                "request list persistence needs a key-value store",
            ));
        }

        let mut requests = Vec::new();
        let mut seen = HashSet::new();
        for source in sources {
            match source {
                RequestListSource::Request(request) => {
                    push_deduplicated(&mut requests, &mut seen, request, options.keep_duplicates);
                }
                RequestListSource::RequestsFromUrl { url, url_pattern } => {
                    let pattern = url_pattern.as_deref().unwrap_or(DEFAULT_URL_PATTERN);
                    let batch = fetch_url_batch(&url, pattern).await?;
                    info!("request list source {} yielded {} urls", url, batch.len());
                    for request in batch {
                        push_deduplicated(
                            &mut requests,
                            &mut seen,
                            request,
                            options.keep_duplicates,
                        );
                    }
                }
            }
        }

        let mut state = ListState {
            requests,
            next_index: 0,
            in_progress: HashSet::new(),
            reclaimed: VecDeque::new(),
            handled_count: 0,
        };

        if let (Some(key), Some(store)) =
            (&options.persist_state_key, &options.key_value_store)
        {
            if let Some(value) = store.get_value(key).await? {
                let persisted: RequestListState = serde_json::from_value(value)?;
                restore_state(&mut state, persisted);
                info!(
                    "request list resumed at index {} with {} reclaimed",
                    state.next_index,
                    state.reclaimed.len()
                );
            }
        }

        Ok(Self {
            state: Mutex::new(state),
            persist_state_key: options.persist_state_key,
            key_value_store: options.key_value_store,
        })
    }

    /// Serve the next request: reclaimed requests first, then the list
    /// order.
    pub async fn fetch_next_request(&self) -> Result<Option<Request>> {
        let mut state = self.state.lock().await;
        let request = match state.reclaimed.pop_front() {
            Some(request) => request,
            None => {
                if state.next_index >= state.requests.len() {
                    return Ok(None);
                }
                let request = state.requests[state.next_index].clone();
                state.next_index += 1;
                request
            }
        };
        state.in_progress.insert(request.unique_key.clone());
        Ok(Some(request))
    }

    /// Finish an in-progress request
    pub async fn mark_request_handled(&self, request: &Request) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.in_progress.remove(&request.unique_key) {
            return Err(Error::storage(format!(
                "cannot mark list request {} handled: not in progress",
                request.unique_key
            )));
        }
        state.handled_count += 1;
        Ok(())
    }

    /// Return an in-progress request so it is served again before the
    /// list advances. Relative order among reclaimed requests is kept.
    pub async fn reclaim_request(&self, request: &Request) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.in_progress.remove(&request.unique_key) {
            return Err(Error::storage(format!(
                "cannot reclaim list request {}: not in progress",
                request.unique_key
            )));
        }
        state.reclaimed.push_back(request.clone());
        Ok(())
    }

    /// Whether all requests have been served
    pub async fn is_empty(&self) -> bool {
        let state = self.state.lock().await;
        state.reclaimed.is_empty() && state.next_index >= state.requests.len()
    }

    /// Whether all requests have been served and finished
    pub async fn is_finished(&self) -> bool {
        let state = self.state.lock().await;
        state.reclaimed.is_empty()
            && state.next_index >= state.requests.len()
            && state.in_progress.is_empty()
    }

    /// Number of requests marked handled on this list
    pub async fn handled_count(&self) -> u64 {
        self.state.lock().await.handled_count
    }

    /// Persist current progress under the configured key. A no-op when
    /// persistence is not configured.
    pub async fn persist_state(&self) -> Result<()> {
        let (key, store) = match (&self.persist_state_key, &self.key_value_store) {
            (Some(key), Some(store)) => (key, store),
            _ => return Ok(()),
        };

        let snapshot = {
            let state = self.state.lock().await;
            RequestListState {
                next_index: state.next_index,
                in_progress: state.in_progress.iter().cloned().collect(),
                reclaimed: state.reclaimed.iter().cloned().collect(),
            }
        };
        let value = serde_json::to_value(&snapshot)?;
        store.set_value(key, &value).await?;
        debug!("request list state persisted under {}", key);
        Ok(())
    }
}

fn push_deduplicated(
    requests: &mut Vec<Request>,
    seen: &mut HashSet<String>,
    request: Request,
    keep_duplicates: bool,
) {
    if keep_duplicates || seen.insert(request.unique_key.clone()) {
        requests.push(request);
    } else {
        debug!("skipping duplicate list request {}", request.url);
    }
}

fn restore_state(state: &mut ListState, persisted: RequestListState) {
    state.next_index = persisted.next_index.min(state.requests.len());

    let mut queued: HashSet<String> = HashSet::new();
    for request in persisted.reclaimed {
        queued.insert(request.unique_key.clone());
        state.reclaimed.push_back(request);
    }
    // Requests in flight at persist time are re-served before the list
    // advances; duplicates with the reclaimed set are skipped.
    for key in persisted.in_progress {
        if queued.contains(&key) {
            continue;
        }
        match state.requests.iter().find(|r| r.unique_key == key) {
            Some(request) => {
                queued.insert(key);
                state.reclaimed.push_back(request.clone());
            }
            None => warn!("persisted in-progress request {} no longer in list", key),
        }
    }
}

async fn fetch_url_batch(url: &str, pattern: &str) -> Result<Vec<Request>> {
    let regex = Regex::new(pattern)
        .map_err(|e| Error::configuration(format!("invalid url pattern {:?}: {}", pattern, e)))?;
    let body = reqwest::get(url)
        .await
        .map_err(|e| Error::transport(e.to_string()))?
        .error_for_status()
        .map_err(|e| Error::transport(e.to_string()))?
        .text()
        .await
        .map_err(|e| Error::transport(e.to_string()))?;

    let mut requests = Vec::new();
    for found in regex.find_iter(&body) {
        match Request::get(found.as_str()) {
            Ok(request) => requests.push(request),
            Err(e) => warn!("skipping unparsable url {:?}: {}", found.as_str(), e),
        }
    }
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKeyValueStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(path: &str) -> Request {
        Request::get(format!("https://example.com/{}", path)).unwrap()
    }

    fn inline(paths: &[&str]) -> Vec<RequestListSource> {
        paths
            .iter()
            .map(|p| RequestListSource::Request(request(p)))
            .collect()
    }

    #[tokio::test]
    async fn test_serves_in_order() {
        let list = RequestList::open(inline(&["a", "b"]), RequestListOptions::default())
            .await
            .unwrap();

        let first = list.fetch_next_request().await.unwrap().unwrap();
        let second = list.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(first.url.path(), "/a");
        assert_eq!(second.url.path(), "/b");
        assert!(list.fetch_next_request().await.unwrap().is_none());
        assert!(list.is_empty().await);
        assert!(!list.is_finished().await);

        list.mark_request_handled(&first).await.unwrap();
        list.mark_request_handled(&second).await.unwrap();
        assert!(list.is_finished().await);
        assert_eq!(list.handled_count().await, 2);
    }

    #[tokio::test]
    async fn test_deduplicates_at_open() {
        let list = RequestList::open(inline(&["a", "a", "b"]), RequestListOptions::default())
            .await
            .unwrap();
        let mut served = 0;
        while list.fetch_next_request().await.unwrap().is_some() {
            served += 1;
        }
        assert_eq!(served, 2);
    }

    #[tokio::test]
    async fn test_keep_duplicates() {
        let list = RequestList::open(
            inline(&["a", "a"]),
            RequestListOptions {
                keep_duplicates: true,
                ..RequestListOptions::default()
            },
        )
        .await
        .unwrap();
        let mut served = 0;
        while list.fetch_next_request().await.unwrap().is_some() {
            served += 1;
        }
        assert_eq!(served, 2);
    }

    #[tokio::test]
    async fn test_reclaimed_served_first_in_order() {
        let list = RequestList::open(inline(&["a", "b", "c"]), RequestListOptions::default())
            .await
            .unwrap();

        let a = list.fetch_next_request().await.unwrap().unwrap();
        let b = list.fetch_next_request().await.unwrap().unwrap();
        list.reclaim_request(&a).await.unwrap();
        list.reclaim_request(&b).await.unwrap();

        // Reclaimed come back before "c", in reclaim order.
        let again = list.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(again.url.path(), "/a");
        let again = list.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(again.url.path(), "/b");
        let next = list.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(next.url.path(), "/c");
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let sources = inline(&["a", "b", "c"]);

        {
            let list = RequestList::open(
                sources.clone(),
                RequestListOptions {
                    persist_state_key: Some("seed-state".into()),
                    key_value_store: Some(store.clone()),
                    ..RequestListOptions::default()
                },
            )
            .await
            .unwrap();

            let a = list.fetch_next_request().await.unwrap().unwrap();
            let b = list.fetch_next_request().await.unwrap().unwrap();
            list.mark_request_handled(&a).await.unwrap();
            list.reclaim_request(&b).await.unwrap();
            list.persist_state().await.unwrap();
        }

        let list = RequestList::open(
            sources,
            RequestListOptions {
                persist_state_key: Some("seed-state".into()),
                key_value_store: Some(store),
                ..RequestListOptions::default()
            },
        )
        .await
        .unwrap();

        // Only the reclaimed "b" and the unserved "c" remain.
        let first = list.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(first.url.path(), "/b");
        let second = list.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(second.url.path(), "/c");
        assert!(list.fetch_next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_progress_requests_reserved_on_restore() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let sources = inline(&["a", "b"]);

        {
            let list = RequestList::open(
                sources.clone(),
                RequestListOptions {
                    persist_state_key: Some("seed-state".into()),
                    key_value_store: Some(store.clone()),
                    ..RequestListOptions::default()
                },
            )
            .await
            .unwrap();
            // "a" is in flight at persist time.
            list.fetch_next_request().await.unwrap().unwrap();
            list.persist_state().await.unwrap();
        }

        let list = RequestList::open(
            sources,
            RequestListOptions {
                persist_state_key: Some("seed-state".into()),
                key_value_store: Some(store),
                ..RequestListOptions::default()
            },
        )
        .await
        .unwrap();

        let first = list.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(first.url.path(), "/a");
        let second = list.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(second.url.path(), "/b");
    }

    #[tokio::test]
    async fn test_url_batch_source() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/seeds.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "https://example.com/1\nnot a url\nhttps://example.com/2\n",
            ))
            .mount(&server)
            .await;

        let list = RequestList::open(
            vec![RequestListSource::RequestsFromUrl {
                url: format!("{}/seeds.txt", server.uri()),
                url_pattern: None,
            }],
            RequestListOptions::default(),
        )
        .await
        .unwrap();

        let first = list.fetch_next_request().await.unwrap().unwrap();
        let second = list.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(first.url.path(), "/1");
        assert_eq!(second.url.path(), "/2");
        assert!(list.fetch_next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persistence_requires_store() {
        let result = RequestList::open(
            inline(&["a"]),
            RequestListOptions {
                persist_state_key: Some("key".into()),
                ..RequestListOptions::default()
            },
        )
        .await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
