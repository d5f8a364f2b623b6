//! # Drover
//!
//! Drover is a request scheduling and execution engine for web crawlers.
//! It drives user-supplied work (fetch + extract) over a frontier of
//! URLs, coordinating a feedback-driven concurrency controller, a
//! deduplicated persistable request queue, and pools of long-lived
//! browser instances and reputation-tracked sessions.
//!
//! ## Components
//!
//! - **core**: request model, error taxonomy, event bus, cancellation.
//! - **autoscaling**: system load snapshots, overload classification,
//!   and the autoscaled task pool.
//! - **storage**: the request list, request queue backends (memory,
//!   file-backed, remote HTTP) and the key-value store seam.
//! - **sessions**: the rotating session pool.
//! - **browser**: the browser instance pool behind an abstract backend.
//! - **crawler**: the engine composing all of the above.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use drover::prelude::*;
//! use futures::FutureExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     env_logger::init();
//!
//!     let queue = Arc::new(MemoryRequestQueue::new());
//!     queue
//!         .add_request(Request::get("https://example.com")?, false)
//!         .await?;
//!
//!     let mut options = CrawlerOptions::new(Arc::new(|ctx: HandlerContext| {
//!         async move {
//!             println!("crawling {}", ctx.request.url);
//!             Ok(HandlerOutcome::default())
//!         }
//!         .boxed()
//!     }));
//!     options.request_queue = Some(queue);
//!
//!     let crawler = Crawler::new(options)?;
//!     let stats = crawler.run().await?;
//!     println!("handled {} requests", stats.requests_handled);
//!     Ok(())
//! }
//! ```

pub use drover_autoscaling as autoscaling;
pub use drover_browser as browser;
pub use drover_core as core;
pub use drover_crawler as crawler;
pub use drover_sessions as sessions;
pub use drover_storage as storage;

// Environment configuration
pub mod config;

/// Prelude module that re-exports commonly used types
pub mod prelude {
    pub use drover_autoscaling::{
        AutoscaledPool, AutoscaledPoolOptions, PoolState, Snapshotter, SnapshotterOptions,
        SystemStatus, SystemStatusOptions,
    };
    pub use drover_browser::{
        BrowserBackend, BrowserLaunchOptions, BrowserPool, BrowserPoolOptions, Page,
    };
    pub use drover_core::error::{Error, Result};
    pub use drover_core::events::{Event, EventBus};
    pub use drover_core::request::{Method, Request};
    pub use drover_crawler::{
        Crawler, CrawlerConfig, CrawlerOptions, CrawlerStats, FailedRequestContext,
        FailedRequestHandler, HandlerContext, HandlerOutcome, RequestHandler,
    };
    pub use drover_sessions::{Session, SessionOptions, SessionPool, SessionPoolOptions};
    pub use drover_storage::{
        AddRequestResult, FsKeyValueStore, FsRequestQueue, KeyValueStore, MemoryKeyValueStore,
        MemoryRequestQueue, RemoteQueueOptions, RemoteRequestQueue, RequestList,
        RequestListOptions, RequestListSource, RequestQueue,
    };

    pub use crate::config::Configuration;
}
