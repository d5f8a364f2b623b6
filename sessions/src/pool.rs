//! The rotating session pool.
//!
//! Hands out random usable sessions, creating new ones while the pool is
//! below capacity and lazily dropping sessions that have gone bad. Live
//! sessions are snapshotted to a key-value store on a timer and at
//! shutdown, and restored on the next startup.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use drover_core::error::{Error, Result};
use drover_storage::kv::KeyValueStore;

use crate::session::{Session, SessionOptions};

/// Shared handle to one session; tasks lock it only for short counter and
/// cookie updates.
pub type SessionHandle = Arc<Mutex<Session>>;

/// Factory for new sessions
pub type CreateSessionFn = Arc<dyn Fn(&SessionOptions) -> Session + Send + Sync>;

/// Options for [`SessionPool`]
#[derive(Clone)]
pub struct SessionPoolOptions {
    /// Maximum number of live sessions
    pub max_pool_size: usize,
    /// Tunables applied to created sessions
    pub session_options: SessionOptions,
    /// Key under which the pool snapshots itself
    pub persist_state_key: Option<String>,
    /// Interval between snapshots
    pub persist_interval: Duration,
}

impl Default for SessionPoolOptions {
    fn default() -> Self {
        Self {
            max_pool_size: 1000,
            session_options: SessionOptions::default(),
            persist_state_key: Some("SESSION_POOL_STATE".to_string()),
            persist_interval: Duration::from_secs(60),
        }
    }
}

/// Persisted shape of the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPoolState {
    pub sessions: Vec<Session>,
    pub persisted_at: DateTime<Utc>,
}

/// Pool of up to `max_pool_size` reputation-tracked sessions
pub struct SessionPool {
    opts: SessionPoolOptions,
    create_session: CreateSessionFn,
    sessions: RwLock<Vec<SessionHandle>>,
    key_value_store: Option<Arc<dyn KeyValueStore>>,
    persist_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionPool {
    /// Open a pool, restoring persisted sessions when a store and key are
    /// configured. Expired sessions are dropped on restore.
    pub async fn open(
        opts: SessionPoolOptions,
        key_value_store: Option<Arc<dyn KeyValueStore>>,
        create_session: Option<CreateSessionFn>,
    ) -> Result<Arc<Self>> {
        if opts.max_pool_size == 0 {
            return Err(Error::configuration("session pool size must be at least 1"));
        }
        if opts.persist_state_key.is_some() && key_value_store.is_none() {
            return Err(Error::configuration(
                "session pool persistence needs a key-value store",
            ));
        }

        let create_session = create_session
            .unwrap_or_else(|| Arc::new(|options: &SessionOptions| Session::new(options)));

        let mut restored: Vec<SessionHandle> = Vec::new();
        if let (Some(key), Some(store)) = (&opts.persist_state_key, &key_value_store) {
            if let Some(value) = store.get_value(key).await? {
                match serde_json::from_value::<SessionPoolState>(value) {
                    Ok(state) => {
                        let total = state.sessions.len();
                        for session in state.sessions {
                            if session.is_usable() {
                                restored.push(Arc::new(Mutex::new(session)));
                            }
                        }
                        info!(
                            "session pool restored {} of {} persisted sessions",
                            restored.len(),
                            total
                        );
                    }
                    Err(e) => warn!("ignoring unreadable session pool state: {}", e),
                }
            }
        }

        let pool = Arc::new(Self {
            opts,
            create_session,
            sessions: RwLock::new(restored),
            key_value_store,
            persist_task: Mutex::new(None),
        });
        pool.start_persistence().await;
        Ok(pool)
    }

    async fn start_persistence(self: &Arc<Self>) {
        if self.opts.persist_state_key.is_none() {
            return;
        }
        let pool = Arc::downgrade(self);
        let interval = self.opts.persist_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                if let Err(e) = pool.persist_state().await {
                    warn!("session pool persistence failed: {}", e);
                }
            }
        });
        *self.persist_task.lock().await = Some(task);
    }

    /// Hand out a session: a new one while the pool is below capacity or
    /// has no usable session, otherwise a random usable one. Unusable
    /// sessions found along the way are removed.
    pub async fn get_session(&self) -> Result<SessionHandle> {
        let mut sessions = self.sessions.write().await;

        // Lazy removal: sessions found unusable here leave the pool.
        let mut kept: Vec<SessionHandle> = Vec::new();
        for handle in sessions.drain(..) {
            let session = handle.lock().await;
            if session.is_usable() {
                drop(session);
                kept.push(handle);
            } else {
                debug!("dropping unusable session {}", session.id);
            }
        }
        *sessions = kept;

        // After cleanup every pooled session is usable, so below-capacity
        // and no-usable-session both collapse into this one check.
        if sessions.len() < self.opts.max_pool_size {
            let session = (self.create_session)(&self.opts.session_options);
            debug!("created session {}", session.id);
            let handle = Arc::new(Mutex::new(session));
            sessions.push(handle.clone());
            return Ok(handle);
        }

        let index = rand::thread_rng().gen_range(0..sessions.len());
        Ok(sessions[index].clone())
    }

    /// Number of live sessions, usable or not
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the pool currently holds no sessions
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Number of currently usable sessions
    pub async fn usable_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        let mut count = 0;
        for handle in sessions.iter() {
            if handle.lock().await.is_usable() {
                count += 1;
            }
        }
        count
    }

    /// Snapshot live sessions to the configured key
    pub async fn persist_state(&self) -> Result<()> {
        let (key, store) = match (&self.opts.persist_state_key, &self.key_value_store) {
            (Some(key), Some(store)) => (key, store),
            _ => return Ok(()),
        };

        let snapshot = {
            let sessions = self.sessions.read().await;
            let mut out = Vec::with_capacity(sessions.len());
            for handle in sessions.iter() {
                out.push(handle.lock().await.clone());
            }
            SessionPoolState {
                sessions: out,
                persisted_at: Utc::now(),
            }
        };
        let value = serde_json::to_value(&snapshot)?;
        store.set_value(key, &value).await?;
        debug!("session pool persisted {} sessions", snapshot.sessions.len());
        Ok(())
    }

    /// Persist one final time and stop the snapshot timer
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(task) = self.persist_task.lock().await.take() {
            task.abort();
        }
        self.persist_state().await
    }
}
