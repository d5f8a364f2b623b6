pub mod cancellation;
pub mod error;
pub mod events;
pub mod request;
pub mod unique_key;

pub use cancellation::{Cancellation, CancellationListener};
pub use error::{Error, Result};
pub use events::{Event, EventBus};
pub use request::{Method, Request, MAX_ERROR_MESSAGES};
pub use unique_key::{compute_unique_key, normalize_url};

/// Re-export commonly used crates
pub use async_trait::async_trait;
pub use futures;
pub use serde;
pub use serde_json;
pub use url;
