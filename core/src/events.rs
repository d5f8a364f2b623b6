//! Typed event bus owned by the crawler.
//!
//! External collaborators subscribe through a handle passed at
//! construction; there is no process-wide singleton. Events are
//! fire-and-forget: emitting never blocks on slow receivers.

use std::fmt;

use log::debug;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Events emitted by the engine for external collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Host migration imminent; receivers should persist
    Migrating,
    /// The crawler is aborting; receivers should stop issuing work
    Aborting,
    /// Periodic request to snapshot state
    PersistState,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Migrating => write!(f, "migrating"),
            Event::Aborting => write!(f, "aborting"),
            Event::PersistState => write!(f, "persist_state"),
        }
    }
}

/// Broadcast channel for [`Event`]s.
///
/// Cloning the bus clones the sender side; every clone emits into the same
/// channel. Receivers that fall behind lose oldest events, which is
/// acceptable for the level-triggered events carried here.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers
    pub fn emit(&self, event: Event) {
        match self.tx.send(event) {
            Ok(receivers) => debug!("emitted event {} to {} receivers", event, receivers),
            Err(_) => debug!("emitted event {} with no receivers", event),
        }
    }

    /// Spawn a listener task invoking `handler` for every occurrence of
    /// `event`. The task ends when the bus is dropped.
    pub fn on<F>(&self, event: Event, handler: F) -> JoinHandle<()>
    where
        F: Fn() + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(received) if received == event => handler(),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("event listener lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(16)
    }
}
