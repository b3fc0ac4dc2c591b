//! Exception notification channel.
//!
//! Every runtime failure in the engine (session I/O, framing, unknown
//! commands, handler faults, pool exhaustion, counter reads) is published
//! here as an `ErrorRecord` instead of being propagated. Any number of
//! producers share one `ExceptionChannel`; any number of consumers may
//! subscribe. The channel is bounded per subscriber: a subscriber that
//! falls behind loses the oldest records.

use crate::error::EngineError;
use crate::runtime::session::SessionId;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, warn};

/// Where an error was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSource {
    /// The listener's accept loop.
    Listener,
    /// A session's receive or send path.
    Session(SessionId),
    /// Command dispatch on behalf of a session.
    Dispatcher { session: SessionId, command: String },
    /// The performance monitor.
    PerformanceMonitor,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSource::Listener => write!(f, "listener"),
            ErrorSource::Session(id) => write!(f, "session {id}"),
            ErrorSource::Dispatcher { session, command } => {
                write!(f, "session {session} command '{command}'")
            }
            ErrorSource::PerformanceMonitor => write!(f, "performance monitor"),
        }
    }
}

/// One published failure.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub source: ErrorSource,
    pub error: Arc<EngineError>,
    pub occurred_at: DateTime<Utc>,
}

/// Cloneable producer handle of the exception channel.
#[derive(Clone)]
pub struct ExceptionChannel {
    sender: broadcast::Sender<ErrorRecord>,
}

impl ExceptionChannel {
    /// Create a channel buffering up to `capacity` records per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Log and publish a failure.
    pub fn report(&self, source: ErrorSource, error: EngineError) {
        if error.is_connection_fatal() {
            warn!(source = %source, error = %error, "Connection failure");
        } else {
            match &error {
                EngineError::HandlerFault { .. } | EngineError::CounterRead(_) => {
                    error!(source = %source, error = %error, "Unhandled failure")
                }
                _ => warn!(source = %source, error = %error, "Reported failure"),
            }
        }

        let record = ErrorRecord {
            source,
            error: Arc::new(error),
            occurred_at: Utc::now(),
        };

        // No subscribers is fine; the failure has been logged.
        let _ = self.sender.send(record);
    }

    /// Receive every record published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorRecord> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
