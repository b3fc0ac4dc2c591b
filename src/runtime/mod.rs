//! Connection runtime.
//!
//! Built on tokio tasks:
//! - `ProxyPool`: fixed set of receive buffers lent to sessions
//! - `Session`: per-connection receive loop and writer
//! - `SessionRegistry`: live sessions by id
//! - `ExceptionChannel`: broadcast stream of runtime failures

pub mod exception;
pub mod proxy;
pub mod registry;
pub mod session;

pub use exception::{ErrorRecord, ErrorSource, ExceptionChannel};
pub use proxy::{Proxy, ProxyPool};
pub use registry::SessionRegistry;
pub use session::{
    AppSession, CloseReason, Session, SessionId, SessionServices, SessionState,
    DEFAULT_FLUSH_TIMEOUT, SEND_QUEUE_CAPACITY,
};
