//! The browser instance pool.
//!
//! Keeps a fleet of long-lived browser instances in an arena indexed by
//! id; pages carry the id and resolve through the pool. Instances move
//! through LAUNCHING -> ACTIVE -> RETIRED -> KILLED, never backwards:
//! retirement stops new-page allocation while open pages finish, and a
//! drained or idle instance is killed.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use drover_core::error::{Error, Result};

use crate::backend::{BrowserBackend, BrowserHandle, BrowserLaunchOptions, PageHandle};

/// Identifier of a pooled browser instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(u64);

/// Lifecycle of an instance; transitions are monotonic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Launching,
    Active,
    Retired,
    Killed,
}

/// Options for [`BrowserPool`]
#[derive(Debug, Clone)]
pub struct BrowserPoolOptions {
    /// Pages an instance may have open at once
    pub max_open_pages_per_instance: usize,
    /// Lifetime page count after which an instance is retired
    pub retire_instance_after_page_count: u64,
    /// An instance that opened no page for this long is killed
    pub kill_instance_after: Duration,
    /// Delay between an instance draining and its kill, letting page
    /// close events settle
    pub instance_kill_settle: Duration,
    /// Grace between terminate and hard kill
    pub process_kill_timeout: Duration,
    /// Hand previously used pages out again instead of closing them
    pub reuse_pages: bool,
    /// Launch instances headless
    pub headless: bool,
    /// Recycle disk-cache directories between instances; only effective
    /// when instances run headful
    pub recycle_disk_cache: bool,
    /// How often idle-instance checks run
    pub housekeeping_interval: Duration,
}

impl Default for BrowserPoolOptions {
    fn default() -> Self {
        Self {
            max_open_pages_per_instance: 20,
            retire_instance_after_page_count: 100,
            kill_instance_after: Duration::from_secs(300),
            instance_kill_settle: Duration::from_secs(1),
            process_kill_timeout: Duration::from_secs(5),
            reuse_pages: false,
            headless: true,
            recycle_disk_cache: false,
            housekeeping_interval: Duration::from_secs(10),
        }
    }
}

struct Instance {
    state: InstanceState,
    handle: Option<Arc<dyn BrowserHandle>>,
    active_pages: usize,
    total_pages: u64,
    last_page_opened_at: Instant,
    session_id: Option<String>,
    disk_cache_dir: Option<PathBuf>,
}

/// A page borrowed from the pool. Holds its instance id, not the
/// instance; hand it back with [`BrowserPool::recycle_page`].
pub struct Page {
    instance_id: InstanceId,
    handle: Box<dyn PageHandle>,
}

impl Page {
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub async fn is_open(&self) -> bool {
        self.handle.is_open().await
    }
}

struct PoolInner {
    instances: HashMap<InstanceId, Instance>,
    next_id: u64,
    idle_pages: VecDeque<Page>,
    free_cache_dirs: Vec<PathBuf>,
    destroyed: bool,
}

/// Fleet of browser instances with rotation, retirement and recycling
pub struct BrowserPool {
    opts: BrowserPoolOptions,
    backend: Arc<dyn BrowserBackend>,
    inner: Mutex<PoolInner>,
    housekeeping: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BrowserPool {
    /// Create a pool and start its housekeeping task
    pub fn new(opts: BrowserPoolOptions, backend: Arc<dyn BrowserBackend>) -> Arc<Self> {
        let pool = Arc::new(Self {
            opts,
            backend,
            inner: Mutex::new(PoolInner {
                instances: HashMap::new(),
                next_id: 0,
                idle_pages: VecDeque::new(),
                free_cache_dirs: Vec::new(),
                destroyed: false,
            }),
            housekeeping: std::sync::Mutex::new(None),
        });
        pool.start_housekeeping();
        pool
    }

    /// Hand out a page on an ACTIVE instance, launching a new instance
    /// when no existing one has capacity. With `reuse_pages`, idle pages
    /// are preferred; every returned page has been verified open on a
    /// live instance.
    pub async fn new_page(self: &Arc<Self>, session_id: Option<&str>) -> Result<Page> {
        if self.opts.reuse_pages {
            if let Some(page) = self.pop_live_idle_page().await {
                return Ok(page);
            }
        }

        // Reserve capacity on an existing instance, or a slot for a new one.
        let (instance_id, handle) = {
            let mut inner = self.inner.lock().await;
            if inner.destroyed {
                return Err(Error::storage("browser pool is destroyed"));
            }

            let existing = inner.instances.iter_mut().find(|(_, instance)| {
                instance.state == InstanceState::Active
                    && instance.handle.is_some()
                    && instance.active_pages < self.opts.max_open_pages_per_instance
                    && instance.total_pages < self.opts.retire_instance_after_page_count
            });

            if let Some((id, instance)) = existing {
                instance.active_pages += 1;
                instance.total_pages += 1;
                instance.last_page_opened_at = Instant::now();
                (*id, instance.handle.clone().unwrap())
            } else {
                let id = InstanceId(inner.next_id);
                inner.next_id += 1;
                let disk_cache_dir = self.take_cache_dir(&mut inner);
                inner.instances.insert(
                    id,
                    Instance {
                        state: InstanceState::Launching,
                        handle: None,
                        active_pages: 0,
                        total_pages: 0,
                        last_page_opened_at: Instant::now(),
                        session_id: session_id.map(str::to_string),
                        disk_cache_dir: disk_cache_dir.clone(),
                    },
                );
                drop(inner);

                let handle = self.launch_instance(id, disk_cache_dir).await?;

                let mut inner = self.inner.lock().await;
                let instance = inner
                    .instances
                    .get_mut(&id)
                    .ok_or_else(|| Error::browser_launch("instance vanished during launch"))?;
                instance.state = InstanceState::Active;
                instance.handle = Some(handle.clone());
                instance.active_pages += 1;
                instance.total_pages += 1;
                instance.last_page_opened_at = Instant::now();
                info!("browser instance {:?} launched", id);
                (id, handle)
            }
        };

        match handle.new_page().await {
            Ok(page_handle) => {
                self.maybe_retire_after_page_count(instance_id).await;
                Ok(Page {
                    instance_id,
                    handle: page_handle,
                })
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                if let Some(instance) = inner.instances.get_mut(&instance_id) {
                    instance.active_pages = instance.active_pages.saturating_sub(1);
                    instance.total_pages = instance.total_pages.saturating_sub(1);
                }
                Err(e)
            }
        }
    }

    async fn launch_instance(
        self: &Arc<Self>,
        id: InstanceId,
        disk_cache_dir: Option<PathBuf>,
    ) -> Result<Arc<dyn BrowserHandle>> {
        if let Some(dir) = &disk_cache_dir {
            tokio::fs::create_dir_all(dir).await?;
        }
        let launch_options = BrowserLaunchOptions {
            headless: self.opts.headless,
            proxy_url: None,
            disk_cache_dir,
            args: Vec::new(),
        };

        match self.backend.launch(&launch_options).await {
            Ok(handle) => Ok(Arc::from(handle)),
            Err(e) => {
                // Free the slot so the failure does not occupy capacity.
                let mut inner = self.inner.lock().await;
                if let Some(instance) = inner.instances.remove(&id) {
                    if let Some(dir) = instance.disk_cache_dir {
                        inner.free_cache_dirs.push(dir);
                    }
                }
                warn!("browser instance {:?} failed to launch: {}", id, e);
                Err(e)
            }
        }
    }

    fn take_cache_dir(&self, inner: &mut PoolInner) -> Option<PathBuf> {
        if !self.opts.recycle_disk_cache || self.opts.headless {
            return None;
        }
        Some(inner.free_cache_dirs.pop().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("drover-cache-{}", Uuid::new_v4().simple()))
        }))
    }

    async fn pop_live_idle_page(self: &Arc<Self>) -> Option<Page> {
        loop {
            let page = {
                let mut inner = self.inner.lock().await;
                inner.idle_pages.pop_front()?
            };

            let open = page.handle.is_open().await;
            let mut inner = self.inner.lock().await;
            match inner.instances.get_mut(&page.instance_id) {
                Some(instance) if instance.state == InstanceState::Active && open => {
                    instance.last_page_opened_at = Instant::now();
                    drop(inner);
                    debug!("reusing idle page {}", page.handle.id());
                    return Some(page);
                }
                _ => {
                    drop(inner);
                    self.discard_page(page).await;
                }
            }
        }
    }

    /// Return a borrowed page. With `reuse_pages` and a live instance the
    /// page goes back to the idle queue, otherwise it is closed; a closed
    /// page may drain its instance and trigger the instance kill.
    pub async fn recycle_page(self: &Arc<Self>, page: Page) {
        if self.opts.reuse_pages && page.handle.is_open().await {
            let mut inner = self.inner.lock().await;
            let live = matches!(
                inner.instances.get(&page.instance_id).map(|i| i.state),
                Some(InstanceState::Active)
            );
            if live && !inner.destroyed {
                inner.idle_pages.push_back(page);
                return;
            }
        }
        self.discard_page(page).await;
    }

    async fn discard_page(self: &Arc<Self>, page: Page) {
        page.handle.close().await;
        let drained_retired = {
            let mut inner = self.inner.lock().await;
            match inner.instances.get_mut(&page.instance_id) {
                Some(instance) => {
                    instance.active_pages = instance.active_pages.saturating_sub(1);
                    instance.state == InstanceState::Retired && instance.active_pages == 0
                }
                None => false,
            }
        };
        if drained_retired {
            self.schedule_kill(page.instance_id);
        }
    }

    async fn maybe_retire_after_page_count(&self, id: InstanceId) {
        let mut inner = self.inner.lock().await;
        if let Some(instance) = inner.instances.get_mut(&id) {
            if instance.state == InstanceState::Active
                && instance.total_pages >= self.opts.retire_instance_after_page_count
            {
                instance.state = InstanceState::Retired;
                info!(
                    "browser instance {:?} retired after {} pages",
                    id, instance.total_pages
                );
            }
        }
    }

    /// Stop allocating new pages on an instance; open pages finish.
    pub async fn retire(&self, id: InstanceId) {
        let mut inner = self.inner.lock().await;
        if let Some(instance) = inner.instances.get_mut(&id) {
            if matches!(
                instance.state,
                InstanceState::Launching | InstanceState::Active
            ) {
                instance.state = InstanceState::Retired;
                info!("browser instance {:?} retired", id);
            }
        }
    }

    /// Retire every instance bound to a session; used when the session
    /// itself is retired upstream.
    pub async fn retire_for_session(&self, session_id: &str) {
        let ids: Vec<InstanceId> = {
            let inner = self.inner.lock().await;
            inner
                .instances
                .iter()
                .filter(|(_, instance)| instance.session_id.as_deref() == Some(session_id))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.retire(id).await;
        }
    }

    /// State of an instance, `None` once it has been killed and removed
    pub async fn instance_state(&self, id: InstanceId) -> Option<InstanceState> {
        self.inner.lock().await.instances.get(&id).map(|i| i.state)
    }

    /// Number of instances currently in the arena
    pub async fn instance_count(&self) -> usize {
        self.inner.lock().await.instances.len()
    }

    /// Sum of open pages across live instances
    pub async fn active_page_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .instances
            .values()
            .map(|i| i.active_pages)
            .sum()
    }

    /// Kill a drained retired instance after a short settle delay, so the
    /// closing page's events finish first. Skipped if pages re-open in
    /// the meantime.
    fn schedule_kill(self: &Arc<Self>, id: InstanceId) {
        let pool = Arc::downgrade(self);
        let settle = self.opts.instance_kill_settle;
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let Some(pool) = pool.upgrade() else { return };
            let still_drained = {
                let inner = pool.inner.lock().await;
                matches!(
                    inner.instances.get(&id),
                    Some(instance)
                        if instance.state == InstanceState::Retired
                            && instance.active_pages == 0
                )
            };
            if still_drained {
                pool.kill_instance(id).await;
            }
        });
    }

    fn start_housekeeping(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let interval = self.opts.housekeeping_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                pool.housekeep().await;
            }
        });
        *self.housekeeping.lock().unwrap() = Some(task);
    }

    async fn housekeep(self: &Arc<Self>) {
        let now = Instant::now();
        let (idle_kills, drained) = {
            let inner = self.inner.lock().await;
            let mut idle_kills = Vec::new();
            let mut drained = Vec::new();
            for (id, instance) in inner.instances.iter() {
                match instance.state {
                    InstanceState::Active
                        if now.duration_since(instance.last_page_opened_at)
                            > self.opts.kill_instance_after =>
                    {
                        idle_kills.push(*id);
                    }
                    InstanceState::Retired if instance.active_pages == 0 => {
                        drained.push(*id);
                    }
                    _ => {}
                }
            }
            (idle_kills, drained)
        };

        // Idle pages on retired instances keep them from draining.
        self.close_idle_pages_of_retired().await;

        for id in idle_kills {
            debug!("killing idle browser instance {:?}", id);
            self.kill_instance(id).await;
        }
        for id in drained {
            self.schedule_kill(id);
        }
    }

    async fn close_idle_pages_of_retired(self: &Arc<Self>) {
        let stale: Vec<Page> = {
            let mut inner = self.inner.lock().await;
            let retired: Vec<InstanceId> = inner
                .instances
                .iter()
                .filter(|(_, i)| i.state != InstanceState::Active)
                .map(|(id, _)| *id)
                .collect();
            let mut stale = Vec::new();
            let mut keep = VecDeque::new();
            while let Some(page) = inner.idle_pages.pop_front() {
                if retired.contains(&page.instance_id) {
                    stale.push(page);
                } else {
                    keep.push_back(page);
                }
            }
            inner.idle_pages = keep;
            stale
        };
        for page in stale {
            self.discard_page(page).await;
        }
    }

    /// Kill an instance: terminate its process, hard-kill it after the
    /// grace period if it is still alive, and drop it from the arena.
    pub async fn kill_instance(self: &Arc<Self>, id: InstanceId) {
        let handle = {
            let mut inner = self.inner.lock().await;
            let Some(mut instance) = inner.instances.remove(&id) else {
                return;
            };
            instance.state = InstanceState::Killed;
            // The cache directory outlives the instance and is reused by
            // the next launch.
            if let Some(dir) = instance.disk_cache_dir.take() {
                inner.free_cache_dirs.push(dir);
            }
            instance.handle
        };

        let Some(handle) = handle else { return };
        handle.terminate().await;
        let timeout = self.opts.process_kill_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if handle.is_alive() {
                warn!("browser instance {:?} survived terminate, hard killing", id);
                handle.kill().await;
            }
        });
        info!("browser instance {:?} killed", id);
    }

    /// Kill every instance and remove recycled cache directories from
    /// the filesystem. The pool is unusable afterwards.
    pub async fn destroy(self: &Arc<Self>) -> Result<()> {
        if let Some(task) = self.housekeeping.lock().unwrap().take() {
            task.abort();
        }

        let (handles, cache_dirs, idle_pages) = {
            let mut inner = self.inner.lock().await;
            inner.destroyed = true;
            let mut handles = Vec::new();
            let mut cache_dirs: Vec<PathBuf> = inner.free_cache_dirs.drain(..).collect();
            for (_, mut instance) in inner.instances.drain() {
                instance.state = InstanceState::Killed;
                if let Some(handle) = instance.handle.take() {
                    handles.push(handle);
                }
                if let Some(dir) = instance.disk_cache_dir.take() {
                    cache_dirs.push(dir);
                }
            }
            let idle_pages: Vec<Page> = inner.idle_pages.drain(..).collect();
            (handles, cache_dirs, idle_pages)
        };

        for page in idle_pages {
            page.handle.close().await;
        }
        for handle in &handles {
            handle.terminate().await;
        }
        tokio::time::sleep(self.opts.process_kill_timeout).await;
        for handle in &handles {
            if handle.is_alive() {
                warn!("browser instance survived terminate on destroy, hard killing");
                handle.kill().await;
            }
        }

        for dir in cache_dirs {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove cache dir {:?}: {}", dir, e);
                }
            }
        }
        info!("browser pool destroyed, {} instances killed", handles.len());
        Ok(())
    }
}
