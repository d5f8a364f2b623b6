//! System load sampling.
//!
//! Samples CPU load, memory use, scheduler tick lag and downstream client
//! health into time-bounded rings. Sampling runs on two cadences: a fast
//! one for CPU and tick lag, a slow one for memory and client state.
//! The rings are single-writer, many-reader; readers query synchronously.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use sysinfo::{Pid, System};
use tokio::task::JoinHandle;

use drover_core::error::{Error, Result};

/// Options for the [`Snapshotter`]
#[derive(Debug, Clone)]
pub struct SnapshotterOptions {
    /// Interval between CPU and tick-lag samples
    pub fast_sample_interval: Duration,
    /// Interval between memory and client samples
    pub slow_sample_interval: Duration,
    /// How long CPU and tick-lag samples are kept
    pub fast_history: Duration,
    /// How long memory and client samples are kept
    pub slow_history: Duration,
    /// CPU is overloaded when the 1-minute load average exceeds this
    /// fraction of the logical core count
    pub max_used_cpu_ratio: f64,
    /// Memory is overloaded when used / max exceeds this ratio
    pub max_used_memory_ratio: f64,
    /// Tick lag is overloaded when a sampling tick arrives this much late
    pub max_blocked: Duration,
    /// Memory envelope; falls back to total system memory when unset
    pub max_memory_bytes: Option<u64>,
}

impl Default for SnapshotterOptions {
    fn default() -> Self {
        Self {
            fast_sample_interval: Duration::from_millis(500),
            slow_sample_interval: Duration::from_secs(1),
            fast_history: Duration::from_secs(60),
            slow_history: Duration::from_secs(30),
            max_used_cpu_ratio: 0.95,
            max_used_memory_ratio: 0.7,
            max_blocked: Duration::from_millis(50),
            max_memory_bytes: None,
        }
    }
}

/// One CPU sample
#[derive(Debug, Clone, Copy)]
pub struct CpuSample {
    pub created_at: Instant,
    /// 1-minute load average divided by logical core count
    pub used_ratio: f64,
    pub is_overloaded: bool,
}

/// One memory sample
#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub created_at: Instant,
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub is_overloaded: bool,
}

/// One scheduler tick-lag sample
#[derive(Debug, Clone, Copy)]
pub struct EventLoopSample {
    pub created_at: Instant,
    /// How much later than scheduled the tick arrived
    pub exceeded: Duration,
    pub is_overloaded: bool,
}

/// One downstream-client sample, reported externally
#[derive(Debug, Clone, Copy)]
pub struct ClientSample {
    pub created_at: Instant,
    pub is_overloaded: bool,
}

#[derive(Default)]
struct Rings {
    cpu: VecDeque<CpuSample>,
    memory: VecDeque<MemorySample>,
    event_loop: VecDeque<EventLoopSample>,
    client: VecDeque<ClientSample>,
}

/// Samples system load into rolling windows.
///
/// `start` spawns the sampling tasks; `stop` winds them down. Samples can
/// also be recorded directly, which is how external collaborators report
/// client health and how tests stub load conditions.
pub struct Snapshotter {
    opts: SnapshotterOptions,
    max_memory_bytes: u64,
    logical_cores: usize,
    rings: Arc<RwLock<Rings>>,
    running: Arc<AtomicBool>,
    client_overloaded: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Snapshotter {
    /// Create a new snapshotter. Reads the memory envelope and core count
    /// once; sampling does not start until [`start`](Self::start).
    pub fn new(opts: SnapshotterOptions) -> Result<Self> {
        if opts.max_used_cpu_ratio <= 0.0 || opts.max_used_memory_ratio <= 0.0 {
            return Err(Error::configuration(
                "snapshotter overload ratios must be positive",
            ));
        }

        let mut system = System::new_all();
        system.refresh_memory();
        let logical_cores = system.cpus().len().max(1);
        let max_memory_bytes = match opts.max_memory_bytes {
            Some(bytes) => bytes,
            None => system.total_memory(),
        };

        Ok(Self {
            opts,
            max_memory_bytes,
            logical_cores,
            rings: Arc::new(RwLock::new(Rings::default())),
            running: Arc::new(AtomicBool::new(false)),
            client_overloaded: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the sampling tasks. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.spawn_fast_sampler());
        tasks.push(self.spawn_slow_sampler());
        info!(
            "snapshotter started: {} logical cores, {} MB memory envelope",
            self.logical_cores,
            self.max_memory_bytes / 1024 / 1024
        );
    }

    /// Stop the sampling tasks
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().unwrap();
        for task in tasks.drain(..) {
            task.abort();
        }
        debug!("snapshotter stopped");
    }

    fn spawn_fast_sampler(&self) -> JoinHandle<()> {
        let rings = self.rings.clone();
        let running = self.running.clone();
        let opts = self.opts.clone();
        let cores = self.logical_cores;

        tokio::spawn(async move {
            let period = opts.fast_sample_interval;
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately and carries no lag information.
            interval.tick().await;
            let mut last_tick = Instant::now();

            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                let now = Instant::now();
                let exceeded = now.duration_since(last_tick).saturating_sub(period);
                last_tick = now;

                let load = System::load_average().one;
                let used_ratio = load / cores as f64;

                let mut rings = rings.write().unwrap();
                push_sample(
                    &mut rings.event_loop,
                    EventLoopSample {
                        created_at: now,
                        exceeded,
                        is_overloaded: exceeded > opts.max_blocked,
                    },
                    |s| s.created_at,
                    opts.fast_history,
                );
                push_sample(
                    &mut rings.cpu,
                    CpuSample {
                        created_at: now,
                        used_ratio,
                        is_overloaded: used_ratio > opts.max_used_cpu_ratio,
                    },
                    |s| s.created_at,
                    opts.fast_history,
                );
            }
        })
    }

    fn spawn_slow_sampler(&self) -> JoinHandle<()> {
        let rings = self.rings.clone();
        let running = self.running.clone();
        let client_overloaded = self.client_overloaded.clone();
        let opts = self.opts.clone();
        let max_memory = self.max_memory_bytes;
        let pid = std::process::id();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(opts.slow_sample_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut system = System::new();

            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                system.refresh_processes();

                let used_bytes = match system.process(Pid::from_u32(pid)) {
                    Some(process) => process.memory(),
                    None => {
                        warn!("snapshotter could not read own process memory");
                        continue;
                    }
                };
                let now = Instant::now();
                let ratio = used_bytes as f64 / max_memory as f64;

                let mut rings = rings.write().unwrap();
                push_sample(
                    &mut rings.memory,
                    MemorySample {
                        created_at: now,
                        used_bytes,
                        max_bytes: max_memory,
                        is_overloaded: ratio > opts.max_used_memory_ratio,
                    },
                    |s| s.created_at,
                    opts.slow_history,
                );
                push_sample(
                    &mut rings.client,
                    ClientSample {
                        created_at: now,
                        is_overloaded: client_overloaded.load(Ordering::SeqCst),
                    },
                    |s| s.created_at,
                    opts.slow_history,
                );
            }
        })
    }

    /// Report downstream client health; picked up by the next slow sample.
    /// Called by storage backends when they observe rate limiting.
    pub fn report_client_overloaded(&self, overloaded: bool) {
        self.client_overloaded.store(overloaded, Ordering::SeqCst);
    }

    /// Record a CPU sample directly
    pub fn record_cpu_sample(&self, used_ratio: f64) {
        let mut rings = self.rings.write().unwrap();
        push_sample(
            &mut rings.cpu,
            CpuSample {
                created_at: Instant::now(),
                used_ratio,
                is_overloaded: used_ratio > self.opts.max_used_cpu_ratio,
            },
            |s| s.created_at,
            self.opts.fast_history,
        );
    }

    /// Record a memory sample directly
    pub fn record_memory_sample(&self, used_bytes: u64) {
        let ratio = used_bytes as f64 / self.max_memory_bytes as f64;
        let mut rings = self.rings.write().unwrap();
        push_sample(
            &mut rings.memory,
            MemorySample {
                created_at: Instant::now(),
                used_bytes,
                max_bytes: self.max_memory_bytes,
                is_overloaded: ratio > self.opts.max_used_memory_ratio,
            },
            |s| s.created_at,
            self.opts.slow_history,
        );
    }

    /// Record a tick-lag sample directly
    pub fn record_event_loop_sample(&self, exceeded: Duration) {
        let mut rings = self.rings.write().unwrap();
        push_sample(
            &mut rings.event_loop,
            EventLoopSample {
                created_at: Instant::now(),
                exceeded,
                is_overloaded: exceeded > self.opts.max_blocked,
            },
            |s| s.created_at,
            self.opts.fast_history,
        );
    }

    /// Record a client sample directly
    pub fn record_client_sample(&self, is_overloaded: bool) {
        let mut rings = self.rings.write().unwrap();
        push_sample(
            &mut rings.client,
            ClientSample {
                created_at: Instant::now(),
                is_overloaded,
            },
            |s| s.created_at,
            self.opts.slow_history,
        );
    }

    /// CPU samples within the trailing window
    pub fn cpu_samples(&self, window: Duration) -> Vec<CpuSample> {
        let rings = self.rings.read().unwrap();
        samples_within(&rings.cpu, |s| s.created_at, window)
    }

    /// Memory samples within the trailing window
    pub fn memory_samples(&self, window: Duration) -> Vec<MemorySample> {
        let rings = self.rings.read().unwrap();
        samples_within(&rings.memory, |s| s.created_at, window)
    }

    /// Tick-lag samples within the trailing window
    pub fn event_loop_samples(&self, window: Duration) -> Vec<EventLoopSample> {
        let rings = self.rings.read().unwrap();
        samples_within(&rings.event_loop, |s| s.created_at, window)
    }

    /// Client samples within the trailing window
    pub fn client_samples(&self, window: Duration) -> Vec<ClientSample> {
        let rings = self.rings.read().unwrap();
        samples_within(&rings.client, |s| s.created_at, window)
    }

    /// The longest window any ring retains
    pub fn full_history(&self) -> Duration {
        self.opts.fast_history.max(self.opts.slow_history)
    }
}

impl Drop for Snapshotter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn push_sample<T>(
    ring: &mut VecDeque<T>,
    sample: T,
    created_at: impl Fn(&T) -> Instant,
    history: Duration,
) {
    ring.push_back(sample);
    let Some(cutoff) = Instant::now().checked_sub(history) else {
        return;
    };
    while let Some(front) = ring.front() {
        if created_at(front) < cutoff {
            ring.pop_front();
        } else {
            break;
        }
    }
}

fn samples_within<T: Copy>(
    ring: &VecDeque<T>,
    created_at: impl Fn(&T) -> Instant,
    window: Duration,
) -> Vec<T> {
    let cutoff = Instant::now().checked_sub(window);
    ring.iter()
        .filter(|s| match cutoff {
            Some(cutoff) => created_at(s) >= cutoff,
            None => true,
        })
        .copied()
        .collect()
}
