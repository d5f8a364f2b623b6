//! Cooperative cancellation for in-flight crawl tasks.
//!
//! One [`Cancellation`] is owned by the scheduler; every task holds a
//! [`CancellationListener`] and races its work against it. Cancellation is
//! level-triggered and one-way: once fired it stays fired.

use std::sync::Arc;

use tokio::sync::watch;

/// The triggering side of a cancellation signal
#[derive(Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Cancellation {
    /// Create a new, untriggered signal
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. All current and future listeners observe it.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether the signal has been fired
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Create a listener for this signal
    pub fn listener(&self) -> CancellationListener {
        CancellationListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// The waiting side of a cancellation signal
pub struct CancellationListener {
    rx: watch::Receiver<bool>,
}

impl CancellationListener {
    /// Resolve once the signal fires. Resolves immediately if it already
    /// has, or if the triggering side was dropped.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether the signal has been fired
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_listener() {
        let cancellation = Cancellation::new();
        let mut listener = cancellation.listener();

        let waiter = tokio::spawn(async move {
            listener.cancelled().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        cancellation.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_listener_after_cancel_resolves_immediately() {
        let cancellation = Cancellation::new();
        cancellation.cancel();

        let mut listener = cancellation.listener();
        assert!(listener.is_cancelled());
        listener.cancelled().await;
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let cancellation = Cancellation::new();
        let clone = cancellation.clone();
        clone.cancel();
        assert!(cancellation.is_cancelled());
    }
}
