pub mod pool;
pub mod session;

pub use pool::{
    CreateSessionFn, SessionHandle, SessionPool, SessionPoolOptions, SessionPoolState,
};
pub use session::{Cookie, Session, SessionOptions};
