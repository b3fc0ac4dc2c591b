//! Command filters.
//!
//! Filters wrap command execution like layers of an onion. The filter list
//! of a command is fixed when the dispatcher is built; every invocation
//! walks it in the same order. For filters `[A, B]`:
//!
//! ```text
//! A.on_executing -> B.on_executing -> command -> B.on_executed -> A.on_executed
//! ```
//!
//! A filter can implement the two hooks, or override `around` to take full
//! control of whether and how the rest of the chain runs.

use super::{Command, HandlerResult};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-invocation state shared by the filters of one dispatch.
pub struct CommandContext<'a, S, R> {
    session: &'a S,
    request: &'a R,
    command: &'a str,
    started: Instant,
    cancelled: bool,
}

impl<'a, S, R> CommandContext<'a, S, R> {
    pub(crate) fn new(session: &'a S, request: &'a R, command: &'a str) -> Self {
        Self {
            session,
            request,
            command,
            started: Instant::now(),
            cancelled: false,
        }
    }

    pub fn session(&self) -> &'a S {
        self.session
    }

    pub fn request(&self) -> &'a R {
        self.request
    }

    /// Registered name of the command being executed.
    pub fn command_name(&self) -> &'a str {
        self.command
    }

    /// Time since dispatch started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stop the chain: the command and any inner filters will not run.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// A cross-cutting behavior applied around command execution.
pub trait CommandFilter<S, R>: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Runs before the inner filters and the command.
    fn on_executing(&self, _ctx: &mut CommandContext<'_, S, R>) {}

    /// Runs after the inner filters and the command returned.
    fn on_executed(&self, _ctx: &CommandContext<'_, S, R>, _result: &HandlerResult) {}

    /// Wrap the rest of the chain.
    fn around(&self, ctx: &mut CommandContext<'_, S, R>, next: Next<'_, S, R>) -> HandlerResult
    where
        S: 'static,
        R: 'static,
    {
        self.on_executing(ctx);
        if ctx.is_cancelled() {
            return Ok(());
        }

        let result = next.run(ctx);
        self.on_executed(ctx, &result);
        result
    }
}

/// The remainder of a filter chain, ending in the command.
pub struct Next<'a, S, R> {
    filters: &'a [Arc<dyn CommandFilter<S, R>>],
    command: &'a dyn Command<S, R>,
}

impl<'a, S: 'static, R: 'static> Next<'a, S, R> {
    pub(crate) fn new(
        filters: &'a [Arc<dyn CommandFilter<S, R>>],
        command: &'a dyn Command<S, R>,
    ) -> Self {
        Self { filters, command }
    }

    /// Run the next filter, or the command once all filters have run.
    pub fn run(self, ctx: &mut CommandContext<'_, S, R>) -> HandlerResult {
        match self.filters.split_first() {
            Some((filter, rest)) => filter.around(
                ctx,
                Next {
                    filters: rest,
                    command: self.command,
                },
            ),
            None => self.command.execute(ctx.session, ctx.request),
        }
    }
}
