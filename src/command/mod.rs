//! Command registration and dispatch.
//!
//! Commands are registered on a `CommandRegistry` at startup. Building the
//! registry resolves each command's full filter chain (global filters first,
//! then the command's own) and yields an immutable `Dispatcher` that is
//! shared by all sessions without locking.
//!
//! The dispatcher is the failure boundary of request handling: unknown keys,
//! handler errors and handler panics are reported on the exception channel
//! and never reach the session's receive loop.

mod filter;

pub use filter::{CommandContext, CommandFilter, Next};

use crate::error::EngineError;
use crate::framing::RequestInfo;
use crate::runtime::{AppSession, ErrorSource, ExceptionChannel};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Result of a command handler.
pub type HandlerResult = anyhow::Result<()>;

/// A request handler bound to a command key.
pub trait Command<S, R>: Send + Sync + 'static {
    /// Key this command is registered under.
    fn name(&self) -> &str;

    fn execute(&self, session: &S, request: &R) -> HandlerResult;
}

struct RegisteredCommand<S, R> {
    command: Arc<dyn Command<S, R>>,
    filters: Vec<Arc<dyn CommandFilter<S, R>>>,
}

/// Startup-time command table builder.
pub struct CommandRegistry<S, R> {
    commands: HashMap<String, RegisteredCommand<S, R>>,
    global_filters: Vec<Arc<dyn CommandFilter<S, R>>>,
    case_insensitive: bool,
}

impl<S, R> Default for CommandRegistry<S, R> {
    fn default() -> Self {
        Self {
            commands: HashMap::new(),
            global_filters: Vec::new(),
            case_insensitive: false,
        }
    }
}

impl<S: 'static, R: 'static> CommandRegistry<S, R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match keys ignoring ASCII case.
    ///
    /// Must be set before commands are registered.
    pub fn case_insensitive(mut self, enabled: bool) -> Self {
        debug_assert!(self.commands.is_empty(), "set before registering commands");
        self.case_insensitive = enabled;
        self
    }

    /// Add a filter applied to every command, outside its own filters.
    pub fn global_filter(&mut self, filter: impl CommandFilter<S, R>) -> &mut Self {
        self.global_filters.push(Arc::new(filter));
        self
    }

    /// Register a command without filters of its own.
    pub fn register(&mut self, command: impl Command<S, R>) -> Result<&mut Self, EngineError> {
        self.register_with_filters(command, Vec::new())
    }

    /// Register a command with its ordered filter list.
    pub fn register_with_filters(
        &mut self,
        command: impl Command<S, R>,
        filters: Vec<Arc<dyn CommandFilter<S, R>>>,
    ) -> Result<&mut Self, EngineError> {
        let key = normalize(command.name(), self.case_insensitive);
        if self.commands.contains_key(&key) {
            return Err(EngineError::DuplicateCommand(command.name().to_string()));
        }

        self.commands.insert(
            key,
            RegisteredCommand {
                command: Arc::new(command),
                filters,
            },
        );
        Ok(self)
    }

    /// Freeze the table into a dispatcher.
    pub fn build(self, exceptions: ExceptionChannel) -> Dispatcher<S, R> {
        let global_filters = self.global_filters;
        let commands = self
            .commands
            .into_iter()
            .map(|(key, entry)| {
                let mut filters = global_filters.clone();
                filters.extend(entry.filters);
                (
                    key,
                    RegisteredCommand {
                        command: entry.command,
                        filters,
                    },
                )
            })
            .collect();

        Dispatcher {
            commands,
            case_insensitive: self.case_insensitive,
            exceptions,
            handled: AtomicU64::new(0),
        }
    }
}

fn normalize(key: &str, case_insensitive: bool) -> String {
    if case_insensitive {
        key.to_ascii_uppercase()
    } else {
        key.to_string()
    }
}

/// What happened to a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The command ran and returned `Ok`.
    Executed,
    /// A filter cancelled the invocation.
    Cancelled,
    /// No command is registered for the key.
    UnknownCommand,
    /// The command or a filter returned an error or panicked.
    Faulted,
}

/// Immutable command table plus the failure boundary around execution.
pub struct Dispatcher<S, R> {
    commands: HashMap<String, RegisteredCommand<S, R>>,
    case_insensitive: bool,
    exceptions: ExceptionChannel,
    handled: AtomicU64,
}

impl<S: AppSession, R: RequestInfo> Dispatcher<S, R> {
    /// Execute the command registered for `request`'s key.
    pub fn dispatch(&self, session: &S, request: R) -> DispatchOutcome {
        let entry = if self.case_insensitive {
            self.commands.get(&request.key().to_ascii_uppercase())
        } else {
            self.commands.get(request.key())
        };

        let Some(entry) = entry else {
            self.exceptions.report(
                ErrorSource::Dispatcher {
                    session: session.id(),
                    command: request.key().to_string(),
                },
                EngineError::UnknownCommand(request.key().to_string()),
            );
            return DispatchOutcome::UnknownCommand;
        };

        self.handled.fetch_add(1, Ordering::Relaxed);
        let name = entry.command.name();
        trace!(session = %session.id(), command = name, "Dispatching");

        let mut ctx = CommandContext::new(session, &request, name);
        let next = Next::new(&entry.filters, entry.command.as_ref());
        let result = panic::catch_unwind(AssertUnwindSafe(|| next.run(&mut ctx)));

        let message = match result {
            Ok(Ok(())) if ctx.is_cancelled() => return DispatchOutcome::Cancelled,
            Ok(Ok(())) => return DispatchOutcome::Executed,
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };

        self.exceptions.report(
            ErrorSource::Dispatcher {
                session: session.id(),
                command: name.to_string(),
            },
            EngineError::HandlerFault {
                command: name.to_string(),
                message,
            },
        );
        DispatchOutcome::Faulted
    }
}

impl<S: 'static, R: 'static> Dispatcher<S, R> {
    /// Whether a command is registered for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.commands
            .contains_key(&normalize(key, self.case_insensitive))
    }

    /// Registered command names, sorted.
    pub fn command_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .commands
            .values()
            .map(|entry| entry.command.name())
            .collect();
        names.sort_unstable();
        names
    }

    /// Requests that reached a registered command.
    pub fn handled_requests(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::framing::StringRequest;
    use crate::runtime::{CloseReason, SessionId, SessionState};
    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::net::SocketAddr;

    /// Session stand-in that records sent data.
    #[derive(Default)]
    pub(crate) struct MockSession {
        pub sent: Mutex<Vec<Bytes>>,
        pub closed: Mutex<Option<CloseReason>>,
    }

    impl AppSession for MockSession {
        fn id(&self) -> SessionId {
            SessionId::new(1)
        }

        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn state(&self) -> SessionState {
            if self.closed.lock().is_some() {
                SessionState::Closed
            } else {
                SessionState::Connected
            }
        }

        fn close(&self, reason: CloseReason) -> bool {
            let mut closed = self.closed.lock();
            if closed.is_some() {
                return false;
            }
            *closed = Some(reason);
            true
        }

        fn send(&self, data: Bytes) -> bool {
            self.sent.lock().push(data);
            true
        }

        fn last_active(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Records the body of every request it handles.
    pub(crate) struct Record(pub Arc<Mutex<Vec<String>>>);

    impl<S: AppSession> Command<S, StringRequest> for Record {
        fn name(&self) -> &str {
            "REC"
        }

        fn execute(&self, _session: &S, request: &StringRequest) -> HandlerResult {
            self.0.lock().push(request.body_str().to_string());
            Ok(())
        }
    }

    pub(crate) struct Fail;

    impl<S: AppSession> Command<S, StringRequest> for Fail {
        fn name(&self) -> &str {
            "FAIL"
        }

        fn execute(&self, _session: &S, _request: &StringRequest) -> HandlerResult {
            anyhow::bail!("handler failed on purpose")
        }
    }

    struct Panic;

    impl Command<MockSession, StringRequest> for Panic {
        fn name(&self) -> &str {
            "PANIC"
        }

        fn execute(&self, _session: &MockSession, _request: &StringRequest) -> HandlerResult {
            panic!("handler panicked on purpose")
        }
    }

    fn dispatcher(
        exceptions: &ExceptionChannel,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Dispatcher<MockSession, StringRequest> {
        let mut registry = CommandRegistry::new();
        registry
            .register(Record(Arc::clone(log)))
            .unwrap()
            .register(Fail)
            .unwrap()
            .register(Panic)
            .unwrap();
        registry.build(exceptions.clone())
    }

    #[test]
    fn test_dispatch_to_registered_command() {
        let exceptions = ExceptionChannel::new(8);
        let log = Arc::default();
        let dispatcher = dispatcher(&exceptions, &log);
        let session = MockSession::default();

        let outcome = dispatcher.dispatch(&session, StringRequest::new("REC", "hello"));

        assert_eq!(outcome, DispatchOutcome::Executed);
        assert_eq!(*log.lock(), ["hello"]);
        assert_eq!(dispatcher.handled_requests(), 1);
        assert_eq!(dispatcher.command_names(), ["FAIL", "PANIC", "REC"]);
    }

    #[test]
    fn test_unknown_command_is_reported() {
        let exceptions = ExceptionChannel::new(8);
        let mut errors = exceptions.subscribe();
        let dispatcher = dispatcher(&exceptions, &Arc::default());
        let session = MockSession::default();

        let outcome = dispatcher.dispatch(&session, StringRequest::new("NOPE", ""));

        assert_eq!(outcome, DispatchOutcome::UnknownCommand);
        let record = errors.try_recv().unwrap();
        assert!(matches!(*record.error, EngineError::UnknownCommand(ref k) if k == "NOPE"));
        assert!(session.closed.lock().is_none());
        assert_eq!(dispatcher.handled_requests(), 0);
    }

    #[test]
    fn test_failures_are_isolated() {
        let exceptions = ExceptionChannel::new(8);
        let mut errors = exceptions.subscribe();
        let log = Arc::default();
        let dispatcher = dispatcher(&exceptions, &log);
        let session = MockSession::default();
        let other = MockSession::default();

        assert_eq!(
            dispatcher.dispatch(&session, StringRequest::new("FAIL", "")),
            DispatchOutcome::Faulted
        );
        assert_eq!(
            dispatcher.dispatch(&session, StringRequest::new("PANIC", "")),
            DispatchOutcome::Faulted
        );

        // Both the same session and another one keep working
        assert_eq!(
            dispatcher.dispatch(&session, StringRequest::new("REC", "after")),
            DispatchOutcome::Executed
        );
        assert_eq!(
            dispatcher.dispatch(&other, StringRequest::new("REC", "other")),
            DispatchOutcome::Executed
        );
        assert_eq!(*log.lock(), ["after", "other"]);
        assert!(session.closed.lock().is_none());

        let first = errors.try_recv().unwrap();
        assert!(matches!(
            *first.error,
            EngineError::HandlerFault { ref message, .. } if message == "handler failed on purpose"
        ));
        let second = errors.try_recv().unwrap();
        assert!(matches!(
            *second.error,
            EngineError::HandlerFault { ref message, .. } if message.contains("handler panicked on purpose")
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry: CommandRegistry<MockSession, StringRequest> = CommandRegistry::new();
        registry.register(Fail).unwrap();

        match registry.register(Fail) {
            Err(EngineError::DuplicateCommand(name)) => assert_eq!(name, "FAIL"),
            Err(other) => panic!("unexpected: {:?}", other),
            Ok(_) => panic!("duplicate accepted"),
        }
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let log = Arc::default();
        let mut registry: CommandRegistry<MockSession, StringRequest> =
            CommandRegistry::new().case_insensitive(true);
        registry.register(Record(Arc::clone(&log))).unwrap();
        let dispatcher = registry.build(ExceptionChannel::new(1));

        assert!(dispatcher.contains("rec"));
        assert_eq!(
            dispatcher.dispatch(&MockSession::default(), StringRequest::new("Rec", "x")),
            DispatchOutcome::Executed
        );
        assert_eq!(*log.lock(), ["x"]);
    }

    struct Tag(&'static str, Arc<Mutex<Vec<String>>>);

    impl CommandFilter<MockSession, StringRequest> for Tag {
        fn name(&self) -> &str {
            self.0
        }

        fn on_executing(&self, _ctx: &mut CommandContext<'_, MockSession, StringRequest>) {
            self.1.lock().push(format!("{}.pre", self.0));
        }

        fn on_executed(
            &self,
            _ctx: &CommandContext<'_, MockSession, StringRequest>,
            _result: &HandlerResult,
        ) {
            self.1.lock().push(format!("{}.post", self.0));
        }
    }

    #[test]
    fn test_global_filters_wrap_command_filters() {
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        let mut registry: CommandRegistry<MockSession, StringRequest> = CommandRegistry::new();
        registry.global_filter(Tag("G", Arc::clone(&log)));
        registry
            .register_with_filters(
                Record(Arc::clone(&log)),
                vec![
                    Arc::new(Tag("A", Arc::clone(&log))),
                    Arc::new(Tag("B", Arc::clone(&log))),
                ],
            )
            .unwrap();
        let dispatcher = registry.build(ExceptionChannel::new(1));

        for _ in 0..2 {
            log.lock().clear();
            dispatcher.dispatch(&MockSession::default(), StringRequest::new("REC", "x"));
            assert_eq!(
                *log.lock(),
                ["G.pre", "A.pre", "B.pre", "x", "B.post", "A.post", "G.post"]
            );
        }
    }
}
