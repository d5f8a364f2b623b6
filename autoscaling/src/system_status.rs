//! OK / overloaded classification over snapshotter windows.

use std::sync::Arc;
use std::time::Duration;

use crate::snapshotter::Snapshotter;

/// Options for [`SystemStatus`]
#[derive(Debug, Clone)]
pub struct SystemStatusOptions {
    /// Window used by [`SystemStatus::is_ok_now`]
    pub current_history: Duration,
    /// Maximum tolerated fraction of overloaded samples
    pub max_overloaded_ratio: f64,
}

impl Default for SystemStatusOptions {
    fn default() -> Self {
        Self {
            current_history: Duration::from_secs(5),
            max_overloaded_ratio: 0.4,
        }
    }
}

/// Classification of one window
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// Whether the window is considered OK
    pub is_ok: bool,
    /// Fraction of samples, across all dimensions, that were overloaded
    pub overloaded_ratio: f64,
    /// Per-dimension overloaded fractions, for logging
    pub cpu_ratio: f64,
    pub memory_ratio: f64,
    pub event_loop_ratio: f64,
    pub client_ratio: f64,
}

/// Classifies the current and historical snapshotter windows.
///
/// A sample counts as overloaded when any dimension flagged it; the
/// aggregate ratio is overloaded samples over total samples across all
/// dimension rings. An empty window reads as OK.
pub struct SystemStatus {
    snapshotter: Arc<Snapshotter>,
    opts: SystemStatusOptions,
}

impl SystemStatus {
    /// Create a new status view over a snapshotter
    pub fn new(snapshotter: Arc<Snapshotter>, opts: SystemStatusOptions) -> Self {
        Self { snapshotter, opts }
    }

    /// Classify the most recent short window
    pub fn current_report(&self) -> StatusReport {
        self.report(self.opts.current_history)
    }

    /// Classify the full retained window
    pub fn historical_report(&self) -> StatusReport {
        self.report(self.snapshotter.full_history())
    }

    /// Whether the most recent short window is OK
    pub fn is_ok_now(&self) -> bool {
        self.current_report().is_ok
    }

    /// Whether the full retained window is OK
    pub fn is_ok_historically(&self) -> bool {
        self.historical_report().is_ok
    }

    fn report(&self, window: Duration) -> StatusReport {
        let cpu = self.snapshotter.cpu_samples(window);
        let memory = self.snapshotter.memory_samples(window);
        let event_loop = self.snapshotter.event_loop_samples(window);
        let client = self.snapshotter.client_samples(window);

        let cpu_overloaded = cpu.iter().filter(|s| s.is_overloaded).count();
        let memory_overloaded = memory.iter().filter(|s| s.is_overloaded).count();
        let event_loop_overloaded = event_loop.iter().filter(|s| s.is_overloaded).count();
        let client_overloaded = client.iter().filter(|s| s.is_overloaded).count();

        let total = cpu.len() + memory.len() + event_loop.len() + client.len();
        let overloaded =
            cpu_overloaded + memory_overloaded + event_loop_overloaded + client_overloaded;

        let overloaded_ratio = ratio(overloaded, total);
        StatusReport {
            is_ok: overloaded_ratio < self.opts.max_overloaded_ratio,
            overloaded_ratio,
            cpu_ratio: ratio(cpu_overloaded, cpu.len()),
            memory_ratio: ratio(memory_overloaded, memory.len()),
            event_loop_ratio: ratio(event_loop_overloaded, event_loop.len()),
            client_ratio: ratio(client_overloaded, client.len()),
        }
    }
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshotter::SnapshotterOptions;

    fn status_over(snapshotter: Arc<Snapshotter>) -> SystemStatus {
        SystemStatus::new(snapshotter, SystemStatusOptions::default())
    }

    fn snapshotter() -> Arc<Snapshotter> {
        Arc::new(
            Snapshotter::new(SnapshotterOptions {
                max_memory_bytes: Some(1000),
                ..SnapshotterOptions::default()
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_empty_window_is_ok() {
        let status = status_over(snapshotter());
        assert!(status.is_ok_now());
        assert!(status.is_ok_historically());
    }

    #[tokio::test]
    async fn test_single_overloaded_dimension_flips_status() {
        let snap = snapshotter();
        // Memory continuously overloaded, CPU fine: half the merged
        // samples are overloaded, which is above the 0.4 default.
        for _ in 0..10 {
            snap.record_memory_sample(990);
            snap.record_cpu_sample(0.1);
        }
        let status = status_over(snap);
        assert!(!status.is_ok_now());
        let report = status.current_report();
        assert!(report.memory_ratio > 0.9);
        assert!(report.cpu_ratio < 0.1);
    }

    #[tokio::test]
    async fn test_minority_overload_stays_ok() {
        let snap = snapshotter();
        for i in 0..10 {
            snap.record_cpu_sample(if i < 2 { 1.5 } else { 0.1 });
        }
        let status = status_over(snap);
        assert!(status.is_ok_now());
        let report = status.current_report();
        assert!((report.overloaded_ratio - 0.2).abs() < 1e-9);
    }
}
