//! The browser capability seam.
//!
//! The pool never names a concrete browser library; whatever drives real
//! browsers implements these traits. The mock backend in this module is
//! the deterministic stand-in used by the engine's tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use drover_core::error::{Error, Result};

/// Options passed to [`BrowserBackend::launch`]
#[derive(Debug, Clone, Default)]
pub struct BrowserLaunchOptions {
    pub headless: bool,
    /// Proxy the instance routes all traffic through
    pub proxy_url: Option<String>,
    /// Disk cache directory handed to the browser process
    pub disk_cache_dir: Option<PathBuf>,
    /// Extra command-line arguments
    pub args: Vec<String>,
}

/// Launches browser instances
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    async fn launch(&self, options: &BrowserLaunchOptions) -> Result<Box<dyn BrowserHandle>>;
}

/// One live browser process
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// Open a new page (tab)
    async fn new_page(&self) -> Result<Box<dyn PageHandle>>;

    /// Ask the process to shut down gracefully
    async fn terminate(&self);

    /// Force the process down
    async fn kill(&self);

    /// Whether the process is still running
    fn is_alive(&self) -> bool;
}

/// One open page (tab) inside a browser instance
#[async_trait]
pub trait PageHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Whether the page is still open
    async fn is_open(&self) -> bool;

    /// Close the page
    async fn close(&self);
}

/// Deterministic in-process backend for tests.
///
/// Counts launches, optionally fails the next N of them, and exposes the
/// liveness of every handle it produced.
#[derive(Default)]
pub struct MockBrowserBackend {
    launches: AtomicUsize,
    fail_next_launches: AtomicUsize,
    spawned: std::sync::Mutex<Vec<Arc<MockBrowserState>>>,
    launch_options: std::sync::Mutex<Vec<BrowserLaunchOptions>>,
}

struct MockBrowserState {
    alive: AtomicBool,
    terminated: AtomicBool,
    pages_opened: AtomicUsize,
    ignore_terminate: bool,
}

impl MockBrowserBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` launches fail
    pub fn fail_next_launches(&self, count: usize) {
        self.fail_next_launches.store(count, Ordering::SeqCst);
    }

    /// Total successful and failed launch attempts
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Number of spawned instances still alive
    pub fn alive_count(&self) -> usize {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.alive.load(Ordering::SeqCst))
            .count()
    }

    /// Number of spawned instances that only died to a hard kill
    pub fn hard_killed_count(&self) -> usize {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .filter(|b| {
                !b.alive.load(Ordering::SeqCst) && b.ignore_terminate
            })
            .count()
    }

    /// Launch instances that ignore graceful termination, forcing the
    /// pool's hard-kill path.
    pub fn ignore_terminate(self: Arc<Self>) -> Arc<IgnoreTerminateBackend> {
        Arc::new(IgnoreTerminateBackend { inner: self })
    }

    /// Options of every launch attempt, in order
    pub fn launched_options(&self) -> Vec<BrowserLaunchOptions> {
        self.launch_options.lock().unwrap().clone()
    }

    fn launch_inner(
        &self,
        options: &BrowserLaunchOptions,
        ignore_terminate: bool,
    ) -> Result<Box<dyn BrowserHandle>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.launch_options.lock().unwrap().push(options.clone());
        let failing = self.fail_next_launches.load(Ordering::SeqCst);
        if failing > 0 {
            self.fail_next_launches.store(failing - 1, Ordering::SeqCst);
            return Err(Error::browser_launch("mock launch failure"));
        }

        let state = Arc::new(MockBrowserState {
            alive: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
            pages_opened: AtomicUsize::new(0),
            ignore_terminate,
        });
        self.spawned.lock().unwrap().push(state.clone());
        Ok(Box::new(MockBrowser { state }))
    }
}

#[async_trait]
impl BrowserBackend for MockBrowserBackend {
    async fn launch(&self, options: &BrowserLaunchOptions) -> Result<Box<dyn BrowserHandle>> {
        self.launch_inner(options, false)
    }
}

/// Wrapper backend whose instances survive `terminate`
pub struct IgnoreTerminateBackend {
    inner: Arc<MockBrowserBackend>,
}

#[async_trait]
impl BrowserBackend for IgnoreTerminateBackend {
    async fn launch(&self, options: &BrowserLaunchOptions) -> Result<Box<dyn BrowserHandle>> {
        self.inner.launch_inner(options, true)
    }
}

struct MockBrowser {
    state: Arc<MockBrowserState>,
}

#[async_trait]
impl BrowserHandle for MockBrowser {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>> {
        if !self.state.alive.load(Ordering::SeqCst) {
            return Err(Error::BrowserPage("instance is dead".to_string()));
        }
        let serial = self.state.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPage {
            id: format!("page-{}", serial),
            open: AtomicBool::new(true),
        }))
    }

    async fn terminate(&self) {
        self.state.terminated.store(true, Ordering::SeqCst);
        if !self.state.ignore_terminate {
            self.state.alive.store(false, Ordering::SeqCst);
        }
    }

    async fn kill(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }
}

struct MockPage {
    id: String,
    open: AtomicBool,
}

#[async_trait]
impl PageHandle for MockPage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_launch_and_page() {
        let backend = MockBrowserBackend::new();
        let browser = backend
            .launch(&BrowserLaunchOptions::default())
            .await
            .unwrap();
        assert!(browser.is_alive());

        let page = browser.new_page().await.unwrap();
        assert!(page.is_open().await);
        page.close().await;
        assert!(!page.is_open().await);

        browser.terminate().await;
        assert!(!browser.is_alive());
        assert_eq!(backend.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_failure_injection() {
        let backend = MockBrowserBackend::new();
        backend.fail_next_launches(1);
        assert!(backend
            .launch(&BrowserLaunchOptions::default())
            .await
            .is_err());
        assert!(backend
            .launch(&BrowserLaunchOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_ignore_terminate_needs_hard_kill() {
        let backend = Arc::new(MockBrowserBackend::new());
        let stubborn = backend.clone().ignore_terminate();
        let browser = stubborn
            .launch(&BrowserLaunchOptions::default())
            .await
            .unwrap();

        browser.terminate().await;
        assert!(browser.is_alive());
        browser.kill().await;
        assert!(!browser.is_alive());
        assert_eq!(backend.hard_killed_count(), 1);
    }
}
