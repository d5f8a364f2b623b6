//! The request queue abstraction.
//!
//! A queue maps request identifiers to requests and tracks each
//! identifier through exactly one of three states: pending, in-progress,
//! handled. All backends provide the same at-least-once contract:
//! a fetched request is either marked handled or reclaimed; a request
//! that is neither is re-served after a restart.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use drover_core::error::Result;
use drover_core::request::Request;

/// Outcome of [`RequestQueue::add_request`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRequestResult {
    /// Identifier of the stored request
    pub request_id: String,
    /// The identifier was already known; the queue was left unchanged
    pub was_already_present: bool,
    /// The identifier was already in the handled state
    pub was_already_handled: bool,
}

/// Deduplicated queue of requests with per-request lifecycle states
#[async_trait]
pub trait RequestQueue: Send + Sync {
    /// Add a request unless its identifier is already known. Idempotent:
    /// a duplicate reports `was_already_present` and does not change the
    /// queue position of the original.
    async fn add_request(&self, request: Request, forefront: bool) -> Result<AddRequestResult>;

    /// Move the next pending request to in-progress and return it;
    /// `None` iff nothing is pending
    async fn fetch_next_request(&self) -> Result<Option<Request>>;

    /// Move an in-progress request to handled. Errors when the request
    /// is not in-progress.
    async fn mark_request_handled(&self, request: &Request) -> Result<()>;

    /// Move an in-progress request back to pending, storing the passed
    /// request state (retry count, error messages). Errors when the
    /// request is not in-progress.
    async fn reclaim_request(&self, request: &Request, forefront: bool) -> Result<()>;

    /// Whether nothing is pending
    async fn is_empty(&self) -> Result<bool>;

    /// Whether nothing is pending and nothing is in-progress
    async fn is_finished(&self) -> Result<bool>;

    /// Number of handled requests
    async fn handled_count(&self) -> Result<u64>;
}
