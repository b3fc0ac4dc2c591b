//! Built-in commands and filters used by the server binary.

pub mod commands;
pub mod filters;

pub use commands::{Add, Echo, Mult, Quit};
pub use filters::{RequestLogFilter, SlowCommandFilter};

use crate::command::CommandRegistry;
use crate::error::EngineError;
use crate::framing::RequestInfo;
use crate::runtime::AppSession;
use std::time::Duration;

/// Commands slower than this are logged at warn.
pub const SLOW_COMMAND_THRESHOLD: Duration = Duration::from_millis(500);

/// Register the built-in commands and filters.
pub fn register<S: AppSession, R: RequestInfo>(
    registry: &mut CommandRegistry<S, R>,
) -> Result<(), EngineError> {
    registry
        .global_filter(RequestLogFilter)
        .global_filter(SlowCommandFilter::new(SLOW_COMMAND_THRESHOLD));

    registry
        .register(Echo)?
        .register(Add)?
        .register(Mult)?
        .register(Quit)?;
    Ok(())
}
