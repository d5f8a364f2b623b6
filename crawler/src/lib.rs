//! The crawler core.
//!
//! Composes the request frontier (list + queue), the autoscaled pool, and
//! the optional session and browser pools into one engine. Each pool task
//! fetches the next request, runs the user handler raced against the
//! cancellation signal, and either marks the request handled or reclaims
//! it with an incremented retry count.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, Mutex, RwLock};
use url::Url;

use drover_autoscaling::{
    AutoscaledPool, PoolCallbacks, Snapshotter, SnapshotterOptions, SystemStatus,
};
use drover_browser::{BrowserPool, Page};
use drover_core::cancellation::Cancellation;
use drover_core::error::{Error, Result};
use drover_core::events::{Event, EventBus};
use drover_core::request::Request;
use drover_sessions::{SessionHandle, SessionPool};
use drover_storage::request_list::RequestList;
use drover_storage::request_queue::RequestQueue;

pub mod config;
pub mod stats;

pub use config::CrawlerConfig;
pub use stats::CrawlerStats;

/// What a request handler receives: the request plus the session and page
/// borrowed for it. The handler must not retain any of them past its own
/// completion.
pub struct HandlerContext {
    pub request: Request,
    pub session: Option<SessionHandle>,
    pub page: Option<Arc<Page>>,
}

/// What a successful handler reports back
#[derive(Debug, Default)]
pub struct HandlerOutcome {
    /// Final URL after redirects, when the handler followed any
    pub loaded_url: Option<Url>,
}

/// The user's per-request work
pub type RequestHandler =
    Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, Result<HandlerOutcome>> + Send + Sync>;

/// What the failure handler receives once a request's retry budget is
/// exhausted. The full message history is on `request.error_messages`.
pub struct FailedRequestContext {
    pub request: Request,
    /// Message of the last error
    pub error_message: String,
}

/// Invoked once per request that exhausted its retries; its own errors
/// put the crawl into an unknown state and terminate it.
pub type FailedRequestHandler =
    Arc<dyn Fn(FailedRequestContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Construction record for [`Crawler`]. At least one of `request_list`
/// and `request_queue` is required.
pub struct CrawlerOptions {
    pub config: CrawlerConfig,
    pub request_list: Option<Arc<RequestList>>,
    pub request_queue: Option<Arc<dyn RequestQueue>>,
    pub request_handler: RequestHandler,
    /// Defaults to logging at error level
    pub failed_request_handler: Option<FailedRequestHandler>,
    pub session_pool: Option<Arc<SessionPool>>,
    pub browser_pool: Option<Arc<BrowserPool>>,
    /// Bus shared with external collaborators; a private one is created
    /// when absent
    pub event_bus: Option<EventBus>,
    /// Snapshotter to drive autoscaling from; a default one is created
    /// when absent
    pub snapshotter: Option<Arc<Snapshotter>>,
}

impl CrawlerOptions {
    /// Minimal options: a handler plus whatever frontier is added next
    pub fn new(request_handler: RequestHandler) -> Self {
        Self {
            config: CrawlerConfig::default(),
            request_list: None,
            request_queue: None,
            request_handler,
            failed_request_handler: None,
            session_pool: None,
            browser_pool: None,
            event_bus: None,
            snapshotter: None,
        }
    }
}

// Everything a pool task needs, cheap to clone into the task future.
#[derive(Clone)]
struct TaskContext {
    config: CrawlerConfig,
    list: Option<Arc<RequestList>>,
    queue: Option<Arc<dyn RequestQueue>>,
    handler: RequestHandler,
    failed_handler: FailedRequestHandler,
    sessions: Option<Arc<SessionPool>>,
    browsers: Option<Arc<BrowserPool>>,
    stats: Arc<RwLock<CrawlerStats>>,
    handled_count: Arc<AtomicU64>,
    cancellation: Cancellation,
}

/// The request scheduling and execution engine
pub struct Crawler {
    config: CrawlerConfig,
    list: Option<Arc<RequestList>>,
    queue: Option<Arc<dyn RequestQueue>>,
    handler: RequestHandler,
    failed_handler: FailedRequestHandler,
    sessions: Option<Arc<SessionPool>>,
    browsers: Option<Arc<BrowserPool>>,
    events: EventBus,
    snapshotter: Arc<Snapshotter>,
    stats: Arc<RwLock<CrawlerStats>>,
    handled_count: Arc<AtomicU64>,
    cancellation: Cancellation,
    pool: Mutex<Option<Arc<AutoscaledPool>>>,
    running: AtomicBool,
}

impl Crawler {
    /// Validate options and build a crawler. Fails synchronously on
    /// missing collaborators or contradictory configuration.
    pub fn new(options: CrawlerOptions) -> Result<Self> {
        options.config.validate()?;
        if options.request_list.is_none() && options.request_queue.is_none() {
            return Err(Error::configuration(
                "crawler needs a request list, a request queue, or both",
            ));
        }

        let snapshotter = match options.snapshotter {
            Some(snapshotter) => snapshotter,
            None => Arc::new(Snapshotter::new(SnapshotterOptions::default())?),
        };

        Ok(Self {
            config: options.config,
            list: options.request_list,
            queue: options.request_queue,
            handler: options.request_handler,
            failed_handler: options
                .failed_request_handler
                .unwrap_or_else(default_failed_request_handler),
            sessions: options.session_pool,
            browsers: options.browser_pool,
            events: options.event_bus.unwrap_or_default(),
            snapshotter,
            stats: Arc::new(RwLock::new(CrawlerStats::default())),
            handled_count: Arc::new(AtomicU64::new(0)),
            cancellation: Cancellation::new(),
            pool: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// The bus this crawler emits on and listens to
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// The snapshotter driving autoscaling; storage clients report
    /// rate limiting into it.
    pub fn snapshotter(&self) -> Arc<Snapshotter> {
        self.snapshotter.clone()
    }

    /// Current statistics
    pub async fn stats(&self) -> CrawlerStats {
        self.stats.read().await.clone()
    }

    /// Requests handled so far, including those restored from a previous
    /// run of the same frontier
    pub fn handled_request_count(&self) -> u64 {
        self.handled_count.load(Ordering::SeqCst)
    }

    /// Concurrency the pool is currently aiming for; `None` while the
    /// crawler is not running
    pub async fn desired_concurrency(&self) -> Option<usize> {
        self.pool
            .lock()
            .await
            .as_ref()
            .map(|pool| pool.desired_concurrency())
    }

    /// Tasks currently in flight; `None` while the crawler is not running
    pub async fn current_concurrency(&self) -> Option<usize> {
        self.pool
            .lock()
            .await
            .as_ref()
            .map(|pool| pool.current_concurrency())
    }

    /// Drive the crawl to completion. Resolves once the frontier is
    /// finished, the crawl limit is reached, or the crawler is aborted;
    /// rejects on the first fatal error.
    pub async fn run(&self) -> Result<CrawlerStats> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::configuration("crawler is already running"));
        }
        if self.cancellation.is_cancelled() {
            warn!("crawler was aborted before run; nothing to do");
            self.running.store(false, Ordering::SeqCst);
            return Ok(self.stats.read().await.clone());
        }
        info!("starting crawl");
        self.stats.write().await.start_time = Some(Instant::now());
        self.snapshotter.start();

        // With both frontiers bound the queue's count wins; the list's is
        // the fallback.
        let restored = match (&self.queue, &self.list) {
            (Some(queue), _) => queue.handled_count().await.unwrap_or_else(|e| {
                warn!("could not restore handled count from queue: {}", e);
                0
            }),
            (None, Some(list)) => list.handled_count().await,
            (None, None) => 0,
        };
        self.handled_count.store(restored, Ordering::SeqCst);

        let status = Arc::new(SystemStatus::new(
            self.snapshotter.clone(),
            self.config.system_status.clone(),
        ));
        let ctx = TaskContext {
            config: self.config.clone(),
            list: self.list.clone(),
            queue: self.queue.clone(),
            handler: self.handler.clone(),
            failed_handler: self.failed_handler.clone(),
            sessions: self.sessions.clone(),
            browsers: self.browsers.clone(),
            stats: self.stats.clone(),
            handled_count: self.handled_count.clone(),
            cancellation: self.cancellation.clone(),
        };

        let run_ctx = ctx.clone();
        let ready_ctx = ctx.clone();
        let finished_ctx = ctx.clone();
        let callbacks = PoolCallbacks {
            run_task: Arc::new(move || {
                let ctx = run_ctx.clone();
                async move { process_one(ctx).await }.boxed()
            }),
            is_task_ready: Arc::new(move || {
                let ctx = ready_ctx.clone();
                async move { is_task_ready(&ctx).await }.boxed()
            }),
            is_finished: Arc::new(move || {
                let ctx = finished_ctx.clone();
                async move { is_finished(&ctx).await }.boxed()
            }),
        };
        let pool = Arc::new(AutoscaledPool::new(
            self.config.autoscaling.clone(),
            status,
            callbacks,
            self.cancellation.clone(),
        )?);
        *self.pool.lock().await = Some(pool.clone());

        let event_listener = self.spawn_event_listener(pool.clone(), ctx.clone());
        let persist_ticker = self.spawn_persist_ticker();
        let stats_logger = self.spawn_stats_logger(pool.clone());

        let result = pool.run().await;

        event_listener.abort();
        persist_ticker.abort();
        if let Some(task) = stats_logger {
            task.abort();
        }
        self.snapshotter.stop();

        persist_frontier(&ctx).await;
        if let Some(sessions) = &self.sessions {
            if let Err(e) = sessions.shutdown().await {
                warn!("session pool shutdown failed: {}", e);
            }
        }

        self.stats.write().await.end_time = Some(Instant::now());
        *self.pool.lock().await = None;
        self.running.store(false, Ordering::SeqCst);

        let stats = self.stats.read().await.clone();
        match result {
            Ok(()) => {
                info!(
                    "crawl finished: {} handled, {} failed, {} retries",
                    stats.requests_handled, stats.requests_failed, stats.retries
                );
                Ok(stats)
            }
            Err(e) => {
                error!("crawl terminated: {}", e);
                Err(e)
            }
        }
    }

    /// Stop starting new tasks and wait up to `timeout` for in-flight
    /// tasks. Returns whether the crawl fully drained.
    pub async fn pause(&self, timeout: Duration) -> bool {
        match self.pool.lock().await.clone() {
            Some(pool) => pool.pause(timeout).await,
            None => true,
        }
    }

    /// Undo a pause
    pub async fn resume(&self) {
        if let Some(pool) = self.pool.lock().await.clone() {
            pool.resume();
        }
    }

    /// Abort the crawl: emits [`Event::Aborting`] and cancels in-flight
    /// tasks, which reclaim their requests without burning a retry.
    pub async fn abort(&self) {
        self.events.emit(Event::Aborting);
        if let Some(pool) = self.pool.lock().await.clone() {
            pool.abort();
        } else {
            self.cancellation.cancel();
        }
    }

    fn spawn_event_listener(
        &self,
        pool: Arc<AutoscaledPool>,
        ctx: TaskContext,
    ) -> tokio::task::JoinHandle<()> {
        let mut rx = self.events.subscribe();
        let grace = self.config.migration_grace;
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Event::Migrating) => {
                        info!("migration signalled, pausing crawl");
                        let drained = pool.pause(grace).await;
                        if !drained {
                            warn!(
                                "migration grace of {:?} expired, persisting anyway; \
                                 duplicates may occur",
                                grace
                            );
                        }
                        persist_frontier(&ctx).await;
                    }
                    Ok(Event::PersistState) => persist_frontier(&ctx).await,
                    Ok(Event::Aborting) => pool.abort(),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("event listener lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_persist_ticker(&self) -> tokio::task::JoinHandle<()> {
        let events = self.events.clone();
        let interval = self.config.persist_state_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                events.emit(Event::PersistState);
            }
        })
    }

    fn spawn_stats_logger(
        &self,
        pool: Arc<AutoscaledPool>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.log_stats {
            return None;
        }
        let stats = self.stats.clone();
        let interval = self.config.stats_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = stats.read().await;
                let rps = stats.requests_per_second().unwrap_or(0.0);
                info!(
                    "Stats: {} handled, {} failed, {} retries, {:.2} req/s, concurrency {}/{}",
                    stats.requests_handled,
                    stats.requests_failed,
                    stats.retries,
                    rps,
                    pool.current_concurrency(),
                    pool.desired_concurrency(),
                );
            }
        }))
    }
}

fn default_failed_request_handler() -> FailedRequestHandler {
    Arc::new(|context: FailedRequestContext| {
        async move {
            error!(
                "request {} failed after {} retries: {}",
                context.request.url, context.request.retry_count, context.error_message
            );
            Ok(())
        }
        .boxed()
    })
}

fn reached_limit(ctx: &TaskContext) -> bool {
    match ctx.config.max_requests_per_crawl {
        Some(max) => ctx.handled_count.load(Ordering::SeqCst) >= max,
        None => false,
    }
}

async fn is_task_ready(ctx: &TaskContext) -> bool {
    if reached_limit(ctx) {
        return false;
    }
    if let Some(list) = &ctx.list {
        if !list.is_empty().await {
            return true;
        }
    }
    if let Some(queue) = &ctx.queue {
        match queue.is_empty().await {
            Ok(empty) => return !empty,
            Err(e) => {
                warn!("could not read queue emptiness: {}", e);
                return false;
            }
        }
    }
    false
}

async fn is_finished(ctx: &TaskContext) -> bool {
    if reached_limit(ctx) {
        return true;
    }
    if let Some(list) = &ctx.list {
        if !list.is_finished().await {
            return false;
        }
    }
    if let Some(queue) = &ctx.queue {
        match queue.is_finished().await {
            Ok(finished) => {
                if !finished {
                    return false;
                }
            }
            Err(e) => {
                warn!("could not read queue finishedness: {}", e);
                return false;
            }
        }
    }
    true
}

/// Take the next request. With both frontiers bound, list requests are
/// funneled through the queue at the forefront first, so retries and
/// at-most-once tracking live in one place.
async fn fetch_next(ctx: &TaskContext) -> Result<Option<Request>> {
    if let Some(list) = &ctx.list {
        match &ctx.queue {
            None => return list.fetch_next_request().await,
            Some(queue) => {
                if let Some(request) = list.fetch_next_request().await? {
                    match queue.add_request(request.clone(), true).await {
                        Ok(_) => list.mark_request_handled(&request).await?,
                        Err(e) => {
                            warn!(
                                "could not enqueue list request {}: {}",
                                request.unique_key, e
                            );
                            list.reclaim_request(&request).await?;
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }
    match &ctx.queue {
        Some(queue) => queue.fetch_next_request().await,
        None => Ok(None),
    }
}

async fn reclaim(ctx: &TaskContext, request: &Request) -> Result<()> {
    match (&ctx.queue, &ctx.list) {
        (Some(queue), _) => queue.reclaim_request(request, true).await,
        (None, Some(list)) => list.reclaim_request(request).await,
        (None, None) => Ok(()),
    }
}

async fn mark_handled(ctx: &TaskContext, request: &mut Request, success: bool) {
    request.mark_handled();
    let result = match (&ctx.queue, &ctx.list) {
        (Some(queue), _) => queue.mark_request_handled(request).await,
        (None, Some(list)) => list.mark_request_handled(request).await,
        (None, None) => Ok(()),
    };
    if let Err(e) = result {
        warn!(
            "could not mark request {} handled: {}",
            request.unique_key, e
        );
    }
    ctx.handled_count.fetch_add(1, Ordering::SeqCst);
    if success {
        ctx.stats.write().await.requests_handled += 1;
    }
}

async fn run_handler(
    ctx: &TaskContext,
    request: &Request,
    session: Option<SessionHandle>,
    page: Option<Arc<Page>>,
) -> Result<HandlerOutcome> {
    let mut cancel = ctx.cancellation.listener();
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let future = (ctx.handler)(HandlerContext {
        request: request.clone(),
        session,
        page,
    });
    tokio::select! {
        result = tokio::time::timeout(ctx.config.request_handler_timeout, future) => {
            match result {
                Ok(result) => result,
                Err(_) => Err(Error::HandlerTimeout(ctx.config.request_handler_timeout)),
            }
        }
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

async fn note_session_failure(ctx: &TaskContext, session: &SessionHandle) {
    let (unusable, session_id) = {
        let mut session = session.lock().await;
        session.mark_bad();
        (!session.is_usable(), session.id.clone())
    };
    if unusable {
        debug!("session {} retired", session_id);
        if let Some(browsers) = &ctx.browsers {
            browsers.retire_for_session(&session_id).await;
        }
    }
}

/// Route a failed request: reclaim while the retry budget lasts, then
/// mark handled and dispatch to the failure handler.
async fn dispatch_failure(ctx: &TaskContext, request: &mut Request, error: Error) -> Result<()> {
    warn!("request {} failed: {}", request.url, error);
    request.push_error_message(error.to_string());

    if !request.no_retry && request.retry_count < ctx.config.max_request_retries {
        request.retry_count += 1;
        ctx.stats.write().await.retries += 1;
        if let Err(e) = reclaim(ctx, request).await {
            warn!("could not reclaim request {}: {}", request.unique_key, e);
        }
        return Ok(());
    }

    mark_handled(ctx, request, false).await;
    ctx.stats.write().await.requests_failed += 1;

    let failed_context = FailedRequestContext {
        request: request.clone(),
        error_message: error.to_string(),
    };
    if let Err(secondary) = (ctx.failed_handler)(failed_context).await {
        return Err(Error::unknown_state(format!(
            "failed-request handler errored: {}",
            secondary
        )));
    }
    Ok(())
}

/// One pool task: fetch, acquire session and page, run the handler,
/// dispatch the outcome.
async fn process_one(ctx: TaskContext) -> Result<()> {
    if ctx.cancellation.is_cancelled() {
        return Ok(());
    }
    let mut request = match fetch_next(&ctx).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(e) => {
            warn!("could not fetch next request: {}", e);
            return Ok(());
        }
    };
    debug!(
        "processing {} (retry {})",
        request.url, request.retry_count
    );

    let session = match &ctx.sessions {
        Some(pool) => match pool.get_session().await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("could not acquire a session: {}", e);
                return dispatch_failure(&ctx, &mut request, e).await;
            }
        },
        None => None,
    };
    let session_id = match &session {
        Some(session) => Some(session.lock().await.id.clone()),
        None => None,
    };

    let page = match &ctx.browsers {
        Some(pool) => match pool.new_page(session_id.as_deref()).await {
            Ok(page) => Some(Arc::new(page)),
            Err(e) => {
                // A launch failure is a transient error of this request.
                if let Some(session) = &session {
                    note_session_failure(&ctx, session).await;
                }
                return dispatch_failure(&ctx, &mut request, e).await;
            }
        },
        None => None,
    };

    let outcome = run_handler(&ctx, &request, session.clone(), page.clone()).await;

    if let (Some(pool), Some(page)) = (&ctx.browsers, page) {
        match Arc::try_unwrap(page) {
            Ok(page) => pool.recycle_page(page).await,
            Err(_) => warn!("handler retained its page past completion"),
        }
    }

    match outcome {
        Ok(outcome) => {
            if outcome.loaded_url.is_some() {
                request.loaded_url = outcome.loaded_url;
            }
            mark_handled(&ctx, &mut request, true).await;
            if let Some(session) = &session {
                session.lock().await.mark_good();
            }
            Ok(())
        }
        Err(Error::Cancelled) => {
            // Abort is not a handler failure: the retry count is untouched.
            if let Err(e) = reclaim(&ctx, &request).await {
                warn!(
                    "could not reclaim request {} on abort: {}",
                    request.unique_key, e
                );
            }
            Ok(())
        }
        Err(e) => {
            if let Some(session) = &session {
                note_session_failure(&ctx, session).await;
            }
            dispatch_failure(&ctx, &mut request, e).await
        }
    }
}

async fn persist_frontier(ctx: &TaskContext) {
    if let Some(list) = &ctx.list {
        if let Err(e) = list.persist_state().await {
            warn!("request list persistence failed: {}", e);
        }
    }
    if let Some(sessions) = &ctx.sessions {
        if let Err(e) = sessions.persist_state().await {
            warn!("session pool persistence failed: {}", e);
        }
    }
}
