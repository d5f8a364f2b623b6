pub mod fs_queue;
pub mod kv;
pub mod memory_queue;
pub mod remote_queue;
pub mod request_list;
pub mod request_queue;

pub use fs_queue::FsRequestQueue;
pub use kv::{FsKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use memory_queue::MemoryRequestQueue;
pub use remote_queue::{RemoteQueueOptions, RemoteRequestQueue};
pub use request_list::{
    RequestList, RequestListOptions, RequestListSource, RequestListState, DEFAULT_URL_PATTERN,
};
pub use request_queue::{AddRequestResult, RequestQueue};
