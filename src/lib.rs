//! socket-engine: a reusable engine for command-dispatching TCP servers.
//!
//! Layers, leaves first:
//! - `runtime`: pooled receive buffers, sessions, session registry and the
//!   exception channel
//! - `framing`: byte stream to request decoding
//! - `command`: command registry, filter chain and dispatcher
//! - `perf`: background sampling of process and thread-pool metrics
//! - `server`: listener, accept loop and server handle
//! - `builtin`: reference commands and filters

pub mod builtin;
pub mod command;
pub mod config;
pub mod error;
pub mod framing;
pub mod perf;
pub mod runtime;
pub mod server;

pub use config::Config;
pub use error::EngineError;
pub use server::{ServerHandle, SocketServer};
