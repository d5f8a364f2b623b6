pub mod backend;
pub mod pool;

pub use backend::{
    BrowserBackend, BrowserHandle, BrowserLaunchOptions, MockBrowserBackend, PageHandle,
};
pub use pool::{BrowserPool, BrowserPoolOptions, InstanceId, InstanceState, Page};
