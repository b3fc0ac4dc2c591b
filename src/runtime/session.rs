//! Per-connection session.
//!
//! A session owns both halves of one connection and runs as two tasks:
//!
//! - the receive loop reads into the session's `Proxy` buffer, feeds the
//!   bytes to the `Framer` and dispatches every complete request in order
//! - the writer drains the outbound queue filled by `Session::send`
//!
//! State machine:
//!
//! ```text
//! Initializing -> Connected -> Closing -> Closed
//! ```
//!
//! `close` moves a live session to `Closing` exactly once and signals both
//! tasks. The receive loop drops its pending read. The writer flushes what
//! was queued before the close, bounded by the services' flush timeout,
//! then shuts its half down. Once both tasks have ended the session is
//! `Closed` and the proxy comes back through the join handle.

use crate::command::Dispatcher;
use crate::error::EngineError;
use crate::framing::{Framer, RequestInfo};
use crate::runtime::exception::{ErrorSource, ExceptionChannel};
use crate::runtime::proxy::Proxy;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// Replies a session may have queued for its writer.
pub const SEND_QUEUE_CAPACITY: usize = 1024;

/// How long a closing session may spend flushing queued replies.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Unique session identifier, assigned in accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Initializing = 0,
    Connected = 1,
    Closing = 2,
    /// Terminal.
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Initializing,
            1 => SessionState::Connected,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Requested by a handler or an external caller.
    Local,
    /// The peer closed its side (zero-byte read).
    RemoteClosed,
    /// The peer sent a malformed frame.
    ProtocolError,
    /// Reading from or writing to the socket failed.
    IoError,
    /// The server is shutting down.
    ServerShutdown,
    /// The outbound queue filled up because the peer stopped reading.
    SlowPeer,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Local => "local",
            CloseReason::RemoteClosed => "remote closed",
            CloseReason::ProtocolError => "protocol error",
            CloseReason::IoError => "I/O error",
            CloseReason::ServerShutdown => "server shutdown",
            CloseReason::SlowPeer => "slow peer",
        };
        f.write_str(s)
    }
}

/// What commands and filters can see of the session they run for.
pub trait AppSession: Send + Sync + 'static {
    fn id(&self) -> SessionId;

    fn remote_addr(&self) -> Option<SocketAddr>;

    fn state(&self) -> SessionState;

    /// Request the session to close. Returns `true` for the caller that
    /// initiated the close, `false` if it was already closing or closed.
    fn close(&self, reason: CloseReason) -> bool;

    /// Queue data for the peer. Returns `false` if the session is not
    /// connected or its outbound queue is full; a full queue closes it.
    fn send(&self, data: Bytes) -> bool;

    /// Time of the last completed receive.
    fn last_active(&self) -> DateTime<Utc>;
}

/// Shared collaborators of every session of a server.
pub struct SessionServices<R> {
    pub dispatcher: Arc<Dispatcher<Session, R>>,
    pub exceptions: ExceptionChannel,
    /// Upper bound on flushing queued replies after a close.
    pub flush_timeout: Duration,
}

impl<R> Clone for SessionServices<R> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            exceptions: self.exceptions.clone(),
            flush_timeout: self.flush_timeout,
        }
    }
}

struct SessionInner {
    id: SessionId,
    remote_addr: Option<SocketAddr>,
    state: AtomicU8,
    close_reason: Mutex<Option<CloseReason>>,
    last_active: Mutex<DateTime<Utc>>,
    outbound: mpsc::Sender<Bytes>,
    closed: watch::Sender<bool>,
}

/// Cheaply cloneable handle to a live session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Start serving a connection.
    ///
    /// Spawns the receive loop and the writer on the current tokio runtime.
    /// The returned join handle completes once both have ended and yields
    /// the proxy, which the caller returns to its pool.
    pub fn start<Rd, Wr, R>(
        id: SessionId,
        remote_addr: Option<SocketAddr>,
        reader: Rd,
        writer: Wr,
        proxy: Proxy,
        framer: Framer<R>,
        services: SessionServices<R>,
    ) -> (Session, JoinHandle<Proxy>)
    where
        Rd: AsyncRead + Unpin + Send + 'static,
        Wr: AsyncWrite + Unpin + Send + 'static,
        R: RequestInfo,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (closed_tx, _) = watch::channel(false);

        let session = Session {
            inner: Arc::new(SessionInner {
                id,
                remote_addr,
                state: AtomicU8::new(SessionState::Initializing as u8),
                close_reason: Mutex::new(None),
                last_active: Mutex::new(Utc::now()),
                outbound: outbound_tx,
                closed: closed_tx,
            }),
        };

        // Subscribe before spawning so no close signal can be missed.
        let send_closed = session.inner.closed.subscribe();
        let recv_closed = session.inner.closed.subscribe();

        let writer_task = tokio::spawn(send_loop(
            session.clone(),
            writer,
            outbound_rx,
            send_closed,
            services.exceptions.clone(),
            services.flush_timeout,
        ));

        session
            .inner
            .state
            .store(SessionState::Connected as u8, Ordering::Release);
        debug!(session = %id, peer = ?remote_addr, buffer = proxy.index(), "Session started");

        let handle = tokio::spawn({
            let session = session.clone();
            async move {
                let proxy =
                    receive_loop(session.clone(), reader, proxy, framer, services, recv_closed)
                        .await;
                if let Err(e) = writer_task.await {
                    error!(session = %session.id(), error = %e, "Writer task failed");
                }
                session.mark_closed();
                proxy
            }
        });

        (session, handle)
    }

    /// Why the session closed, once it is closing.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.inner.close_reason.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    fn touch(&self) {
        *self.inner.last_active.lock() = Utc::now();
    }

    fn mark_closed(&self) {
        self.inner
            .state
            .store(SessionState::Closed as u8, Ordering::Release);
        debug!(session = %self.inner.id, reason = ?self.close_reason(), "Session closed");
    }
}

impl AppSession for Session {
    fn id(&self) -> SessionId {
        self.inner.id
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    fn close(&self, reason: CloseReason) -> bool {
        let won = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                match SessionState::from_u8(state) {
                    SessionState::Initializing | SessionState::Connected => {
                        Some(SessionState::Closing as u8)
                    }
                    SessionState::Closing | SessionState::Closed => None,
                }
            })
            .is_ok();

        if !won {
            return false;
        }

        *self.inner.close_reason.lock() = Some(reason);
        debug!(session = %self.inner.id, %reason, "Closing session");
        self.inner.closed.send_replace(true);
        true
    }

    fn send(&self, data: Bytes) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.inner.outbound.try_send(data) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %self.inner.id, "Outbound queue full, closing session");
                self.close(CloseReason::SlowPeer);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn last_active(&self) -> DateTime<Utc> {
        *self.inner.last_active.lock()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Resolves once the session has been asked to close.
async fn close_requested(closed: &mut watch::Receiver<bool>) {
    loop {
        let requested = *closed.borrow_and_update();
        if requested || closed.changed().await.is_err() {
            return;
        }
    }
}

async fn receive_loop<Rd, R>(
    session: Session,
    mut reader: Rd,
    mut proxy: Proxy,
    mut framer: Framer<R>,
    services: SessionServices<R>,
    mut closed: watch::Receiver<bool>,
) -> Proxy
where
    Rd: AsyncRead + Unpin,
    R: RequestInfo,
{
    let id = session.id();

    loop {
        let read = tokio::select! {
            biased;
            _ = close_requested(&mut closed) => None,
            read = reader.read(proxy.begin_receive()) => Some(read),
        };

        let n = match read {
            // Close won the race; the dropped read will never complete.
            None => {
                proxy.abandon_receive();
                break;
            }
            Some(Ok(0)) => {
                proxy.complete_receive(0);
                session.close(CloseReason::RemoteClosed);
                break;
            }
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                proxy.abandon_receive();
                services
                    .exceptions
                    .report(ErrorSource::Session(id), EngineError::from(e));
                session.close(CloseReason::IoError);
                break;
            }
        };

        session.touch();
        trace!(session = %id, bytes = n, "Received");

        for frame in framer.feed(proxy.complete_receive(n)) {
            // A handler may have closed the session; remaining frames are dropped.
            if !session.is_connected() {
                break;
            }

            match frame {
                Ok(request) => {
                    services.dispatcher.dispatch(&session, request);
                }
                Err(e) => {
                    services
                        .exceptions
                        .report(ErrorSource::Session(id), EngineError::from(e));
                    session.close(CloseReason::ProtocolError);
                    break;
                }
            }
        }

        if !session.is_connected() {
            break;
        }
    }

    proxy
}

async fn send_loop<Wr>(
    session: Session,
    mut writer: Wr,
    mut outbound: mpsc::Receiver<Bytes>,
    mut closed: watch::Receiver<bool>,
    exceptions: ExceptionChannel,
    flush_timeout: Duration,
) where
    Wr: AsyncWrite + Unpin,
{
    // Reply being written; `write_all_buf` advances it, so a write cut
    // short by the close resumes where it stopped.
    let mut current: Option<Bytes> = None;

    loop {
        if current.is_none() {
            tokio::select! {
                biased;
                _ = close_requested(&mut closed) => break,
                data = outbound.recv() => match data {
                    Some(data) => current = Some(data),
                    None => break,
                },
            }
        }

        let Some(data) = current.as_mut() else {
            continue;
        };
        let written = tokio::select! {
            biased;
            written = writer.write_all_buf(data) => Some(written),
            _ = close_requested(&mut closed) => None,
        };
        match written {
            Some(Ok(())) => current = None,
            Some(Err(e)) => {
                exceptions.report(ErrorSource::Session(session.id()), EngineError::from(e));
                session.close(CloseReason::IoError);
                return;
            }
            None => break,
        }
    }

    // Flush what was queued before the close.
    let flush = async {
        if let Some(mut data) = current {
            writer.write_all_buf(&mut data).await?;
        }
        while let Ok(mut data) = outbound.try_recv() {
            writer.write_all_buf(&mut data).await?;
        }
        writer.shutdown().await
    };

    match tokio::time::timeout(flush_timeout, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(session = %session.id(), error = %e, "Flush after close failed"),
        Err(_) => debug!(session = %session.id(), "Flush after close timed out"),
    }
}
