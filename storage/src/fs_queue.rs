//! Local file-backed request queue.
//!
//! Layout under the queue directory:
//!
//! ```text
//! requests/<id>.json   one file per known request, kept current
//! pending/index.json   pending identifiers in queue order
//! handled/<id>.json    final request state, one file per handled request
//! ```
//!
//! In-progress state is deliberately not persisted: requests that were in
//! flight when the process died are re-queued at the front on the next
//! open, which is what gives the queue its at-least-once behavior.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use serde_json::Value;
use tokio::sync::Mutex;

use drover_core::error::{Error, Result};
use drover_core::request::Request;

use crate::kv::write_json_atomically;
use crate::request_queue::{AddRequestResult, RequestQueue};

struct Inner {
    requests: HashMap<String, Request>,
    pending: VecDeque<String>,
    in_progress: HashSet<String>,
    handled: HashSet<String>,
}

/// Request queue persisted as a directory tree
pub struct FsRequestQueue {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl FsRequestQueue {
    /// Open a queue directory, creating it if needed and restoring any
    /// previously persisted state.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(dir.join("requests")).await?;
        tokio::fs::create_dir_all(dir.join("pending")).await?;
        tokio::fs::create_dir_all(dir.join("handled")).await?;

        let mut requests = HashMap::new();
        let mut entries = tokio::fs::read_dir(dir.join("requests")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let bytes = tokio::fs::read(entry.path()).await?;
            match serde_json::from_slice::<Request>(&bytes) {
                Ok(request) => {
                    requests.insert(request.unique_key.clone(), request);
                }
                Err(e) => warn!(
                    "skipping unreadable request file {:?}: {}",
                    entry.path(),
                    e
                ),
            }
        }

        let mut handled = HashSet::new();
        let mut entries = tokio::fs::read_dir(dir.join("handled")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let bytes = tokio::fs::read(entry.path()).await?;
            match serde_json::from_slice::<Request>(&bytes) {
                Ok(request) => {
                    handled.insert(request.unique_key);
                }
                Err(e) => warn!(
                    "skipping unreadable handled file {:?}: {}",
                    entry.path(),
                    e
                ),
            }
        }

        let index_path = dir.join("pending").join("index.json");
        let mut pending: VecDeque<String> = match tokio::fs::read(&index_path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<String>>(&bytes)?
                .into_iter()
                .filter(|id| requests.contains_key(id))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => return Err(e.into()),
        };

        // Anything known but neither pending nor handled was in progress
        // when the previous process died; re-serve it first.
        let accounted: HashSet<&String> = pending.iter().chain(handled.iter()).collect();
        let mut orphaned: Vec<String> = requests
            .keys()
            .filter(|id| !accounted.contains(id))
            .cloned()
            .collect();
        orphaned.sort();
        for id in orphaned.into_iter().rev() {
            pending.push_front(id);
        }

        let queue = Self {
            dir,
            inner: Mutex::new(Inner {
                requests,
                pending,
                in_progress: HashSet::new(),
                handled,
            }),
        };
        queue.write_index_locked(&*queue.inner.lock().await).await?;
        Ok(queue)
    }

    // Custom unique keys may contain characters unusable in file names;
    // those are stored hex-encoded under an `enc-` prefix.
    fn file_stem(id: &str) -> String {
        let safe = !id.is_empty()
            && !id.starts_with("enc-")
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if safe {
            id.to_string()
        } else {
            let mut encoded = String::from("enc-");
            for byte in id.as_bytes() {
                encoded.push_str(&format!("{:02x}", byte));
            }
            encoded
        }
    }

    fn request_path(&self, id: &str) -> PathBuf {
        self.dir
            .join("requests")
            .join(format!("{}.json", Self::file_stem(id)))
    }

    fn handled_path(&self, id: &str) -> PathBuf {
        self.dir
            .join("handled")
            .join(format!("{}.json", Self::file_stem(id)))
    }

    async fn write_request(&self, request: &Request) -> Result<()> {
        let value: Value = serde_json::to_value(request)?;
        write_json_atomically(&self.request_path(&request.unique_key), &value).await
    }

    async fn write_index_locked(&self, inner: &Inner) -> Result<()> {
        let ids: Vec<&String> = inner.pending.iter().collect();
        let value = serde_json::to_value(ids)?;
        write_json_atomically(&self.dir.join("pending").join("index.json"), &value).await
    }
}

#[async_trait]
impl RequestQueue for FsRequestQueue {
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

        self.write_request(&request).await?;
        inner.requests.insert(key.clone(), request);
        if forefront {
            inner.pending.push_front(key.clone());
        } else {
            inner.pending.push_back(key.clone());
        }
        self.write_index_locked(&inner).await?;

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
        self.write_index_locked(&inner).await?;
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
        if !inner.in_progress.contains(key) {
            return Err(Error::storage(format!(
                "cannot mark request {} handled: not in progress",
                key
            )));
        }

        let mut stored = request.clone();
        if stored.handled_at.is_none() {
            stored.handled_at = Some(Utc::now());
        }
        let value: Value = serde_json::to_value(&stored)?;
        write_json_atomically(&self.handled_path(key), &value).await?;
        self.write_request(&stored).await?;

        inner.in_progress.remove(key);
        inner.handled.insert(key.clone());
        inner.requests.insert(key.clone(), stored);
        Ok(())
    }

    async fn reclaim_request(&self, request: &Request, forefront: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let key = &request.unique_key;
        if !inner.in_progress.contains(key) {
            return Err(Error::storage(format!(
                "cannot reclaim request {}: not in progress",
                key
            )));
        }

        self.write_request(request).await?;
        inner.in_progress.remove(key);
        inner.requests.insert(key.clone(), request.clone());
        if forefront {
            inner.pending.push_front(key.clone());
        } else {
            inner.pending.push_back(key.clone());
        }
        self.write_index_locked(&inner).await?;
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
