//! Reference filters.

use crate::command::{CommandContext, CommandFilter, HandlerResult};
use crate::framing::RequestInfo;
use crate::runtime::AppSession;
use std::time::Duration;
use tracing::{debug, warn, Level};

/// Logs every request and its outcome at debug level.
pub struct RequestLogFilter;

impl<S: AppSession, R: RequestInfo> CommandFilter<S, R> for RequestLogFilter {
    fn name(&self) -> &str {
        "request-log"
    }

    fn on_executing(&self, ctx: &mut CommandContext<'_, S, R>) {
        if tracing::enabled!(Level::DEBUG) {
            debug!(
                session = %ctx.session().id(),
                command = ctx.command_name(),
                body_len = ctx.request().body().len(),
                "Executing"
            );
        }
    }

    fn on_executed(&self, ctx: &CommandContext<'_, S, R>, result: &HandlerResult) {
        if tracing::enabled!(Level::DEBUG) {
            debug!(
                session = %ctx.session().id(),
                command = ctx.command_name(),
                elapsed_us = ctx.elapsed().as_micros() as u64,
                ok = result.is_ok(),
                "Executed"
            );
        }
    }
}

/// Warns about commands that run longer than a threshold.
pub struct SlowCommandFilter {
    threshold: Duration,
}

impl SlowCommandFilter {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    pub fn is_slow(&self, elapsed: Duration) -> bool {
        elapsed >= self.threshold
    }
}

impl<S: AppSession, R: RequestInfo> CommandFilter<S, R> for SlowCommandFilter {
    fn name(&self) -> &str {
        "slow-command"
    }

    fn on_executed(&self, ctx: &CommandContext<'_, S, R>, _result: &HandlerResult) {
        let elapsed = ctx.elapsed();
        if self.is_slow(elapsed) {
            warn!(
                session = %ctx.session().id(),
                command = ctx.command_name(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow command"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::commands::Echo;
    use crate::command::tests::MockSession;
    use crate::command::{CommandRegistry, DispatchOutcome};
    use crate::framing::StringRequest;
    use crate::runtime::ExceptionChannel;

    #[test]
    fn test_slow_threshold() {
        let filter = SlowCommandFilter::new(Duration::from_millis(100));
        assert!(!filter.is_slow(Duration::from_millis(99)));
        assert!(filter.is_slow(Duration::from_millis(100)));
    }

    #[test]
    fn test_filters_do_not_change_outcome() {
        let mut registry: CommandRegistry<MockSession, StringRequest> = CommandRegistry::new();
        registry
            .global_filter(RequestLogFilter)
            .global_filter(SlowCommandFilter::new(Duration::ZERO));
        registry.register(Echo).unwrap();
        let dispatcher = registry.build(ExceptionChannel::new(1));

        let session = MockSession::default();
        let outcome = dispatcher.dispatch(&session, StringRequest::new("ECHO", "hi"));

        assert_eq!(outcome, DispatchOutcome::Executed);
        assert_eq!(session.sent.lock().len(), 1);
    }
}
