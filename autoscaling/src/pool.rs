//! The autoscaled task pool.
//!
//! Runs caller-supplied tasks in parallel and adjusts the desired
//! concurrency from observed system status: scale up only when the system
//! has been historically OK and the pool is near saturation, scale down as
//! soon as the current window is not OK.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use drover_core::cancellation::Cancellation;
use drover_core::error::{Error, Result};

use crate::rate_limiter::TokenBucket;
use crate::system_status::SystemStatus;

/// A unit of pool work
pub type TaskFuture = BoxFuture<'static, Result<()>>;
/// An asynchronous predicate
pub type BoolFuture = BoxFuture<'static, bool>;

/// The three callbacks driving a pool
pub struct PoolCallbacks {
    /// Performs one unit of work. An error returned here is fatal: the
    /// pool cancels all in-flight tasks and `run` returns the error.
    pub run_task: Arc<dyn Fn() -> TaskFuture + Send + Sync>,
    /// Whether another task could start right now
    pub is_task_ready: Arc<dyn Fn() -> BoolFuture + Send + Sync>,
    /// Whether all work is done; checked only while the pool is idle
    pub is_finished: Arc<dyn Fn() -> BoolFuture + Send + Sync>,
}

/// Options for [`AutoscaledPool`]
#[derive(Debug, Clone)]
pub struct AutoscaledPoolOptions {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    /// Initial desired concurrency; defaults to `min_concurrency`
    pub desired_concurrency: Option<usize>,
    /// Scale up only when current / desired reaches this ratio
    pub desired_concurrency_ratio: f64,
    pub scale_up_step_ratio: f64,
    pub scale_down_step_ratio: f64,
    /// Interval between scaling decisions
    pub autoscale_interval: Duration,
    /// Interval between attempts to start new tasks
    pub maybe_run_interval: Duration,
    /// Optional cap on task starts per minute
    pub max_tasks_per_minute: Option<u32>,
}

impl Default for AutoscaledPoolOptions {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 200,
            desired_concurrency: None,
            desired_concurrency_ratio: 0.95,
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            autoscale_interval: Duration::from_secs(10),
            maybe_run_interval: Duration::from_millis(500),
            max_tasks_per_minute: None,
        }
    }
}

impl AutoscaledPoolOptions {
    /// Validate option consistency
    pub fn validate(&self) -> Result<()> {
        if self.min_concurrency == 0 {
            return Err(Error::configuration("min_concurrency must be at least 1"));
        }
        if self.max_concurrency < self.min_concurrency {
            return Err(Error::configuration(
                "max_concurrency must not be below min_concurrency",
            ));
        }
        if let Some(desired) = self.desired_concurrency {
            if desired < self.min_concurrency || desired > self.max_concurrency {
                return Err(Error::configuration(
                    "desired_concurrency must lie within [min_concurrency, max_concurrency]",
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.desired_concurrency_ratio) {
            return Err(Error::configuration(
                "desired_concurrency_ratio must be within [0, 1]",
            ));
        }
        if self.scale_up_step_ratio <= 0.0 || self.scale_down_step_ratio <= 0.0 {
            return Err(Error::configuration("scale step ratios must be positive"));
        }
        if self.max_tasks_per_minute == Some(0) {
            return Err(Error::configuration(
                "max_tasks_per_minute must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Running,
    Paused,
    Stopping,
    Stopped,
    /// Terminal from any state
    Aborted,
}

/// Feedback-controlled concurrency executor.
///
/// `run` drives tasks until `is_finished` reports done or `abort` is
/// called; `pause` stops starting new tasks and waits for in-flight work
/// up to a timeout.
pub struct AutoscaledPool {
    opts: AutoscaledPoolOptions,
    status: Arc<SystemStatus>,
    callbacks: PoolCallbacks,
    state: Mutex<PoolState>,
    desired: AtomicUsize,
    current: Arc<AtomicUsize>,
    cancellation: Cancellation,
    rate_limiter: Option<TokenBucket>,
}

impl AutoscaledPool {
    /// Create a new pool. The cancellation signal is fired on abort and
    /// on fatal task errors; tasks race their work against it.
    pub fn new(
        opts: AutoscaledPoolOptions,
        status: Arc<SystemStatus>,
        callbacks: PoolCallbacks,
        cancellation: Cancellation,
    ) -> Result<Self> {
        opts.validate()?;
        let desired = opts.desired_concurrency.unwrap_or(opts.min_concurrency);
        let rate_limiter = opts.max_tasks_per_minute.map(TokenBucket::per_minute);
        Ok(Self {
            opts,
            status,
            callbacks,
            state: Mutex::new(PoolState::Created),
            desired: AtomicUsize::new(desired),
            current: Arc::new(AtomicUsize::new(0)),
            cancellation,
            rate_limiter,
        })
    }

    /// The cancellation signal fired when the pool aborts. Tasks should
    /// race their work against a listener of this signal.
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    /// Number of tasks currently in flight
    pub fn current_concurrency(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Concurrency the pool is currently aiming for
    pub fn desired_concurrency(&self) -> usize {
        self.desired.load(Ordering::SeqCst)
    }

    /// Current lifecycle state
    pub fn state(&self) -> PoolState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: PoolState) {
        let mut state = self.state.lock().unwrap();
        // Aborted is terminal.
        if *state != PoolState::Aborted {
            *state = next;
        }
    }

    /// Drive tasks until finished or aborted. Returns the first fatal
    /// task error, if any.
    pub async fn run(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                PoolState::Created | PoolState::Stopped => *state = PoolState::Running,
                _ => return Err(Error::configuration("pool is already running")),
            }
        }
        info!(
            "pool starting: concurrency {}..{}, desired {}",
            self.opts.min_concurrency,
            self.opts.max_concurrency,
            self.desired.load(Ordering::SeqCst)
        );

        let mut tasks: FuturesUnordered<JoinHandle<Result<()>>> = FuturesUnordered::new();
        let mut run_tick = tokio::time::interval(self.opts.maybe_run_interval);
        run_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut scale_tick = tokio::time::interval(self.opts.autoscale_interval);
        scale_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The immediate first scale tick carries no new information.
        scale_tick.tick().await;

        let result = loop {
            tokio::select! {
                _ = run_tick.tick() => {
                    if self.state() == PoolState::Running {
                        self.maybe_start_tasks(&mut tasks).await;
                    }
                }
                _ = scale_tick.tick() => {
                    if self.state() == PoolState::Running {
                        self.autoscale();
                    }
                }
                Some(joined) = tasks.next(), if !tasks.is_empty() => {
                    self.current.fetch_sub(1, Ordering::SeqCst);
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!("fatal task error, aborting pool: {}", e);
                            self.set_state(PoolState::Aborted);
                            self.cancellation.cancel();
                            self.drain(&mut tasks).await;
                            break Err(e);
                        }
                        Err(join_error) => {
                            error!("task panicked, aborting pool: {}", join_error);
                            self.set_state(PoolState::Aborted);
                            self.cancellation.cancel();
                            self.drain(&mut tasks).await;
                            break Err(Error::unknown_state(format!(
                                "pool task panicked: {}",
                                join_error
                            )));
                        }
                    }
                }
            }

            match self.state() {
                PoolState::Aborted => {
                    // In-flight tasks observe the cancellation signal and
                    // settle promptly, reclaiming their requests.
                    self.drain(&mut tasks).await;
                    break Ok(());
                }
                PoolState::Running => {
                    if self.current.load(Ordering::SeqCst) == 0
                        && tasks.is_empty()
                        && (self.callbacks.is_finished)().await
                    {
                        self.set_state(PoolState::Stopping);
                    }
                }
                PoolState::Stopping => {
                    if tasks.is_empty() {
                        break Ok(());
                    }
                }
                PoolState::Created | PoolState::Stopped | PoolState::Paused => {}
            }
        };

        if self.state() != PoolState::Aborted {
            self.set_state(PoolState::Stopped);
        }
        info!("pool finished: {:?}", self.state());
        result
    }

    /// Stop starting new tasks and wait up to `timeout` for in-flight
    /// tasks to finish. Returns whether the pool fully drained in time.
    pub async fn pause(&self, timeout: Duration) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state == PoolState::Running {
                *state = PoolState::Paused;
            }
        }
        info!("pool paused, waiting up to {:?} for in-flight tasks", timeout);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.current.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "pause grace period expired with {} tasks in flight",
                    self.current.load(Ordering::SeqCst)
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Undo a pause
    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == PoolState::Paused {
            *state = PoolState::Running;
            info!("pool resumed");
        }
    }

    /// Abort the pool: stop starting tasks and signal cancellation to
    /// in-flight tasks without waiting for them.
    pub fn abort(&self) {
        {
            let mut state = self.state.lock().unwrap();
            *state = PoolState::Aborted;
        }
        self.cancellation.cancel();
        info!("pool aborted");
    }

    async fn maybe_start_tasks(&self, tasks: &mut FuturesUnordered<JoinHandle<Result<()>>>) {
        loop {
            if self.state() != PoolState::Running {
                break;
            }
            let current = self.current.load(Ordering::SeqCst);
            if current >= self.desired.load(Ordering::SeqCst) {
                break;
            }
            if !(self.callbacks.is_task_ready)().await {
                break;
            }
            if let Some(limiter) = &self.rate_limiter {
                if !limiter.try_acquire() {
                    debug!(
                        "task start rate limited, next token in {:?}",
                        limiter.time_to_token()
                    );
                    break;
                }
            }

            self.current.fetch_add(1, Ordering::SeqCst);
            let future = (self.callbacks.run_task)();
            tasks.push(tokio::spawn(future));
        }
    }

    fn autoscale(&self) {
        let desired = self.desired.load(Ordering::SeqCst);
        let current = self.current.load(Ordering::SeqCst);

        let saturated = current as f64 / desired as f64 >= self.opts.desired_concurrency_ratio;
        if saturated && self.status.is_ok_historically() {
            let step = (desired as f64 * self.opts.scale_up_step_ratio).ceil() as usize;
            let next = (desired + step).min(self.opts.max_concurrency);
            if next != desired {
                debug!("scaling up: desired {} -> {}", desired, next);
                self.desired.store(next, Ordering::SeqCst);
            }
        } else if !self.status.is_ok_now() {
            let step = (desired as f64 * self.opts.scale_down_step_ratio).ceil() as usize;
            let next = desired.saturating_sub(step).max(self.opts.min_concurrency);
            if next != desired {
                debug!("scaling down: desired {} -> {}", desired, next);
                self.desired.store(next, Ordering::SeqCst);
            }
        }
    }

    async fn drain(&self, tasks: &mut FuturesUnordered<JoinHandle<Result<()>>>) {
        while let Some(joined) = tasks.next().await {
            self.current.fetch_sub(1, Ordering::SeqCst);
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("task failed during drain: {}", e),
                Err(join_error) => warn!("task join error during drain: {}", join_error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshotter::{Snapshotter, SnapshotterOptions};
    use crate::system_status::SystemStatusOptions;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn quiet_status() -> Arc<SystemStatus> {
        let snapshotter = Arc::new(
            Snapshotter::new(SnapshotterOptions {
                max_memory_bytes: Some(1000),
                ..SnapshotterOptions::default()
            })
            .unwrap(),
        );
        Arc::new(SystemStatus::new(
            snapshotter,
            SystemStatusOptions::default(),
        ))
    }

    fn overloaded_status() -> (Arc<Snapshotter>, Arc<SystemStatus>) {
        let snapshotter = Arc::new(
            Snapshotter::new(SnapshotterOptions {
                max_memory_bytes: Some(1000),
                ..SnapshotterOptions::default()
            })
            .unwrap(),
        );
        let status = Arc::new(SystemStatus::new(
            snapshotter.clone(),
            SystemStatusOptions::default(),
        ));
        (snapshotter, status)
    }

    fn fast_opts() -> AutoscaledPoolOptions {
        AutoscaledPoolOptions {
            maybe_run_interval: Duration::from_millis(10),
            autoscale_interval: Duration::from_millis(50),
            ..AutoscaledPoolOptions::default()
        }
    }

    fn counting_callbacks(
        counter: Arc<AtomicUsize>,
        finish_at: usize,
    ) -> PoolCallbacks {
        let run_counter = counter.clone();
        let ready_counter = counter.clone();
        let finished_counter = counter;
        PoolCallbacks {
            run_task: Arc::new(move || {
                let counter = run_counter.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
            is_task_ready: Arc::new(move || {
                let done = ready_counter.load(Ordering::SeqCst) >= finish_at;
                async move { !done }.boxed()
            }),
            is_finished: Arc::new(move || {
                let done = finished_counter.load(Ordering::SeqCst) >= finish_at;
                async move { done }.boxed()
            }),
        }
    }

    #[tokio::test]
    async fn test_runs_until_finished() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = AutoscaledPool::new(
            fast_opts(),
            quiet_status(),
            counting_callbacks(counter.clone(), 5),
            Cancellation::new(),
        )
        .unwrap();

        pool.run().await.unwrap();
        assert!(counter.load(Ordering::SeqCst) >= 5);
        assert_eq!(pool.current_concurrency(), 0);
        assert_eq!(pool.state(), PoolState::Stopped);
    }

    #[tokio::test]
    async fn test_fatal_task_error_rejects_run() {
        let pool = AutoscaledPool::new(
            fast_opts(),
            quiet_status(),
            PoolCallbacks {
                run_task: Arc::new(|| {
                    async { Err(Error::unknown_state("boom")) }.boxed()
                }),
                is_task_ready: Arc::new(|| async { true }.boxed()),
                is_finished: Arc::new(|| async { false }.boxed()),
            },
            Cancellation::new(),
        )
        .unwrap();

        let result = pool.run().await;
        assert!(matches!(result, Err(Error::UnknownState(_))));
        assert_eq!(pool.state(), PoolState::Aborted);
    }

    #[tokio::test]
    async fn test_abort_resolves_run() {
        let pool = Arc::new(
            AutoscaledPool::new(
                fast_opts(),
                quiet_status(),
                PoolCallbacks {
                    run_task: Arc::new(|| {
                        async {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Ok(())
                        }
                        .boxed()
                    }),
                    is_task_ready: Arc::new(|| async { true }.boxed()),
                    is_finished: Arc::new(|| async { false }.boxed()),
                },
                Cancellation::new(),
            )
            .unwrap(),
        );

        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.abort();

        let result = tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(pool.state(), PoolState::Aborted);
    }

    #[tokio::test]
    async fn test_concurrency_stays_clamped() {
        let max_seen = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let counter = Arc::new(AtomicUsize::new(0));

        let opts = AutoscaledPoolOptions {
            min_concurrency: 1,
            max_concurrency: 3,
            desired_concurrency: Some(3),
            ..fast_opts()
        };

        let run_in_flight = in_flight.clone();
        let run_max = max_seen.clone();
        let run_counter = counter.clone();
        let finished_counter = counter.clone();
        let pool = AutoscaledPool::new(
            opts,
            quiet_status(),
            PoolCallbacks {
                run_task: Arc::new(move || {
                    let in_flight = run_in_flight.clone();
                    let max_seen = run_max.clone();
                    let counter = run_counter.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                    .boxed()
                }),
                is_task_ready: Arc::new(|| async { true }.boxed()),
                is_finished: Arc::new(move || {
                    let done = finished_counter.load(Ordering::SeqCst) >= 20;
                    async move { done }.boxed()
                }),
            },
            Cancellation::new(),
        )
        .unwrap();

        // is_task_ready stays true, so the run ends via abort once enough
        // tasks have completed.
        let pool = Arc::new(pool);
        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run().await })
        };
        while counter.load(Ordering::SeqCst) < 20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.abort();
        runner.await.unwrap().unwrap();

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_scale_down_under_memory_pressure() {
        let (snapshotter, status) = overloaded_status();
        let opts = AutoscaledPoolOptions {
            min_concurrency: 1,
            max_concurrency: 50,
            desired_concurrency: Some(10),
            maybe_run_interval: Duration::from_millis(10),
            autoscale_interval: Duration::from_millis(30),
            ..AutoscaledPoolOptions::default()
        };

        let feeder = {
            let snapshotter = snapshotter.clone();
            tokio::spawn(async move {
                loop {
                    snapshotter.record_memory_sample(990);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };

        let pool = Arc::new(
            AutoscaledPool::new(
                opts,
                status,
                PoolCallbacks {
                    run_task: Arc::new(|| {
                        async {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            Ok(())
                        }
                        .boxed()
                    }),
                    is_task_ready: Arc::new(|| async { true }.boxed()),
                    is_finished: Arc::new(|| async { false }.boxed()),
                },
                Cancellation::new(),
            )
            .unwrap(),
        );

        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run().await })
        };

        // Three scaling intervals at step ceil(10 * 0.05) = 1 each.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let desired = pool.desired_concurrency();
        assert!(desired <= 7, "expected scale-down, desired = {}", desired);
        assert!(desired >= 1);

        pool.abort();
        runner.await.unwrap().unwrap();
        feeder.abort();
    }

    #[tokio::test]
    async fn test_pause_waits_for_in_flight() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(
            AutoscaledPool::new(
                fast_opts(),
                quiet_status(),
                counting_callbacks(counter.clone(), usize::MAX),
                Cancellation::new(),
            )
            .unwrap(),
        );

        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let drained = pool.pause(Duration::from_secs(2)).await;
        assert!(drained);
        assert_eq!(pool.current_concurrency(), 0);
        let after_pause = counter.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_pause);

        pool.resume();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(counter.load(Ordering::SeqCst) > after_pause);

        pool.abort();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_caps_task_starts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let opts = AutoscaledPoolOptions {
            max_tasks_per_minute: Some(3),
            desired_concurrency: Some(10),
            min_concurrency: 1,
            max_concurrency: 10,
            ..fast_opts()
        };
        let pool = Arc::new(
            AutoscaledPool::new(
                opts,
                quiet_status(),
                counting_callbacks(counter.clone(), usize::MAX),
                Cancellation::new(),
            )
            .unwrap(),
        );

        let runner = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.run().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        pool.abort();
        runner.await.unwrap().unwrap();

        // Burst capacity is the per-minute rate; refill within 200ms is
        // negligible.
        assert!(counter.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_option_validation() {
        let mut opts = AutoscaledPoolOptions::default();
        opts.min_concurrency = 0;
        assert!(opts.validate().is_err());

        let mut opts = AutoscaledPoolOptions::default();
        opts.max_concurrency = 0;
        assert!(opts.validate().is_err());

        let mut opts = AutoscaledPoolOptions::default();
        opts.desired_concurrency = Some(500);
        assert!(opts.validate().is_err());
    }
}
