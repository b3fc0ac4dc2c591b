//! TCP socket server.
//!
//! Binds the listener, accepts connections and gives each one a `Session`
//! backed by a pooled `Proxy`. Connections arriving while every proxy is
//! lent are rejected immediately; the accept loop never waits for a free
//! proxy.

use crate::command::{CommandRegistry, Dispatcher};
use crate::config::Config;
use crate::error::EngineError;
use crate::framing::{
    BinaryRequest, FrameDecoder, Framer, LengthPrefixedDecoder, LineDecoder, RequestInfo,
    StringRequest,
};
use crate::perf::{
    MonitorHandle, PerformanceMonitor, ProcessCounters, ServerMetadata, ServerStatus,
    StatusInfoCollection, StatusProvider, SysinfoCounters, ThreadPoolProbe,
};
use crate::runtime::{
    CloseReason, ErrorRecord, ErrorSource, ExceptionChannel, Proxy, ProxyPool, Session,
    SessionId, SessionRegistry, SessionServices, DEFAULT_FLUSH_TIMEOUT,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type DecoderFactory<R> = Arc<dyn Fn() -> Box<dyn FrameDecoder<Request = R>> + Send + Sync>;

/// A configured, not yet started server.
pub struct SocketServer<R> {
    config: Config,
    dispatcher: Arc<Dispatcher<Session, R>>,
    decoder: DecoderFactory<R>,
    exceptions: ExceptionChannel,
    metadata: ServerMetadata,
}

impl<R: RequestInfo> SocketServer<R> {
    /// Create a server whose sessions frame requests with decoders made by
    /// `decoder`. The registry is frozen here.
    pub fn new<F, D>(config: Config, registry: CommandRegistry<Session, R>, decoder: F) -> Self
    where
        F: Fn() -> D + Send + Sync + 'static,
        D: FrameDecoder<Request = R> + 'static,
    {
        let exceptions = ExceptionChannel::new(config.error_channel_capacity);
        let dispatcher = Arc::new(registry.build(exceptions.clone()));
        let decoder: DecoderFactory<R> =
            Arc::new(move || Box::new(decoder()) as Box<dyn FrameDecoder<Request = R>>);

        Self {
            config,
            dispatcher,
            decoder,
            exceptions,
            metadata: ServerMetadata::server(),
        }
    }

    /// Override the status keys the performance monitor populates.
    pub fn with_metadata(mut self, metadata: ServerMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Receive failures from the moment the server starts.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorRecord> {
        self.exceptions.subscribe()
    }

    /// Bind the listener and start accepting connections.
    pub async fn start(self) -> Result<ServerHandle, EngineError> {
        let addr = self
            .config
            .listen_addr()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        let listener = bind_listener(addr, self.config.backlog)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            pool: ProxyPool::new(self.config.max_connections, self.config.receive_buffer_size),
            registry: Arc::new(SessionRegistry::new()),
            dispatcher: self.dispatcher,
            decoder: self.decoder,
            exceptions: self.exceptions.clone(),
            accepted: AtomicU64::new(0),
            running: AtomicBool::new(true),
        });

        let monitor = if self.config.disable_performance {
            info!("Performance monitor disabled");
            None
        } else {
            let counters = SysinfoCounters::new()
                .map(|counters| Box::new(counters) as Box<dyn ProcessCounters>);
            let monitor = PerformanceMonitor::new(
                self.config.performance_interval(),
                self.metadata,
                ThreadPoolProbe::current(
                    self.config.max_working_threads,
                    self.config.max_blocking_threads,
                ),
                Arc::clone(&shared) as Arc<dyn StatusProvider>,
                self.exceptions.clone(),
                counters,
            );
            Some(monitor.start()?)
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared), shutdown_rx));

        info!(
            address = %local_addr,
            max_connections = self.config.max_connections,
            framing = ?self.config.framing,
            "Server listening"
        );

        Ok(ServerHandle {
            local_addr,
            registry: Arc::clone(&shared.registry),
            status: shared,
            exceptions: self.exceptions,
            shutdown: shutdown_tx,
            accept_task,
            monitor,
        })
    }
}

impl SocketServer<StringRequest> {
    /// Server speaking `KEY body\r\n` lines.
    pub fn line(config: Config, registry: CommandRegistry<Session, StringRequest>) -> Self {
        let max_line_length = config.max_request_length;
        Self::new(config, registry, move || LineDecoder::new(max_line_length))
    }
}

impl SocketServer<BinaryRequest> {
    /// Server speaking fixed-width key + length-prefixed body frames.
    pub fn length_prefixed(config: Config, registry: CommandRegistry<Session, BinaryRequest>) -> Self {
        let key_width = config.key_width;
        let max_body_length = config.max_request_length;
        Self::new(config, registry, move || {
            LengthPrefixedDecoder::new(key_width, max_body_length)
        })
    }
}

/// Create the listening socket.
fn bind_listener(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    TcpListener::from_std(socket.into())
}

/// State shared by the accept loop, session reapers and the monitor.
struct ServerShared<R> {
    pool: ProxyPool,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher<Session, R>>,
    decoder: DecoderFactory<R>,
    exceptions: ExceptionChannel,
    accepted: AtomicU64,
    running: AtomicBool,
}

impl<R: RequestInfo> ServerShared<R> {
    fn services(&self) -> SessionServices<R> {
        SessionServices {
            dispatcher: Arc::clone(&self.dispatcher),
            exceptions: self.exceptions.clone(),
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }

    fn accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, sessions: &mut JoinSet<()>) {
        self.accepted.fetch_add(1, Ordering::Relaxed);

        let proxy = match self.pool.acquire() {
            Ok(proxy) => proxy,
            Err(e) => {
                // Dropping the stream closes the connection.
                warn!(peer = %peer, "Rejecting connection, no free proxy");
                self.exceptions.report(ErrorSource::Listener, e);
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let id = self.registry.next_id();
        let (reader, writer) = stream.into_split();
        let framer = Framer::from_boxed((self.decoder)());
        let (session, handle) = Session::start(
            id,
            Some(peer),
            reader,
            writer,
            proxy,
            framer,
            self.services(),
        );
        self.registry.insert(session);

        let shared = Arc::clone(self);
        sessions.spawn(async move { shared.reap(id, handle).await });
    }

    /// Return a finished session's proxy and forget the session. The join
    /// handle resolves only once the session's writer has released the socket.
    async fn reap(&self, id: SessionId, handle: JoinHandle<Proxy>) {
        match handle.await {
            Ok(proxy) => self.pool.release(proxy),
            Err(e) => error!(session = %id, error = %e, "Session task failed, proxy lost"),
        }
        self.registry.remove(id);
    }
}

impl<R: RequestInfo> StatusProvider for ServerShared<R> {
    fn server_status(&self) -> ServerStatus {
        ServerStatus {
            is_running: self.running.load(Ordering::Relaxed),
            session_count: self.registry.len(),
            available_proxies: self.pool.available(),
            accepted_connections: self.accepted.load(Ordering::Relaxed),
            handled_requests: self.dispatcher.handled_requests(),
        }
    }
}

async fn accept_loop<R: RequestInfo>(
    listener: TcpListener,
    shared: Arc<ServerShared<R>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    shared.accept(stream, peer, &mut sessions);
                }
                Err(e) => {
                    shared.exceptions.report(ErrorSource::Listener, EngineError::from(e));
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }

        // Drop finished reapers
        while sessions.try_join_next().is_some() {}
    }

    drop(listener);
    shared.running.store(false, Ordering::Relaxed);

    let closing = shared.registry.close_all(CloseReason::ServerShutdown);
    info!(sessions = closing, "Server shutting down");

    while sessions.join_next().await.is_some() {}
    debug!(available = shared.pool.available(), "All sessions closed");
}

/// Handle to a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    status: Arc<dyn StatusProvider>,
    registry: Arc<SessionRegistry>,
    exceptions: ExceptionChannel,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    monitor: Option<MonitorHandle>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Latest performance snapshot, if the monitor is running and has
    /// completed a cycle.
    pub fn status(&self) -> Option<Arc<StatusInfoCollection>> {
        self.monitor.as_ref().and_then(MonitorHandle::snapshot)
    }

    /// Live server figures, independent of the monitor.
    pub fn server_status(&self) -> ServerStatus {
        self.status.server_status()
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.registry.ids()
    }

    /// Close one session. Returns `false` if it is unknown or already closing.
    pub fn close_session(&self, id: SessionId) -> bool {
        self.registry.close(id, CloseReason::Local)
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorRecord> {
        self.exceptions.subscribe()
    }

    /// Forward a sibling-process exit to the performance monitor.
    pub fn notify_sibling_exit(&self) -> bool {
        self.monitor
            .as_ref()
            .is_some_and(MonitorHandle::notify_sibling_exit)
    }

    /// Stop accepting, close every session, wait for their receive loops to
    /// end and stop the monitor.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);

        if let Err(e) = self.accept_task.await {
            error!(error = %e, "Accept loop failed");
        }

        if let Some(monitor) = self.monitor {
            if tokio::task::spawn_blocking(move || monitor.stop())
                .await
                .is_err()
            {
                warn!("Failed to stop performance monitor");
            }
        }

        info!("Server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(max_connections: usize) -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            max_connections,
            disable_performance: true,
            ..Config::default()
        }
    }

    async fn start_line_server(max_connections: usize) -> ServerHandle {
        let mut registry = CommandRegistry::new();
        builtin::register(&mut registry).unwrap();
        SocketServer::line(test_config(max_connections), registry)
            .start()
            .await
            .unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_line_round_trip() {
        let server = start_line_server(4).await;
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        // Pipelined requests, one of them split across writes
        write.write_all(b"ECHO hello\r\nADD 1 2").await.unwrap();
        write.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        write.write_all(b" 3\r\nMULT 6 7\r\n").await.unwrap();

        assert_eq!(lines.next_line().await.unwrap().unwrap(), "hello");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "6");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "42");

        // Unknown and failing commands leave the connection open
        write.write_all(b"NOPE\r\nADD x\r\nECHO still here\r\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "still here");

        write.write_all(b"QUIT\r\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "BYE");
        assert_eq!(lines.next_line().await.unwrap(), None);

        wait_for(|| server.session_count() == 0).await;
        let status = server.server_status();
        assert_eq!(status.available_proxies, 4);
        assert_eq!(status.accepted_connections, 1);
        assert_eq!(status.handled_requests, 6);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_length_prefixed_round_trip() {
        let mut registry = CommandRegistry::new();
        builtin::register(&mut registry).unwrap();
        let config = test_config(2);
        let encoder = LengthPrefixedDecoder::new(config.key_width, config.max_request_length);
        let server = SocketServer::length_prefixed(config, registry)
            .start()
            .await
            .unwrap();

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut frames = encoder.encode("ADD", b"40 2").unwrap();
        frames.extend_from_slice(&encoder.encode("ECHO", b"bin").unwrap());
        stream.write_all(&frames).await.unwrap();

        let mut reply = [0u8; 9];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"42\r\nbin\r\n");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_capacity_rejects_extra_connection() {
        let server = start_line_server(2).await;
        let mut errors = server.subscribe_errors();
        let addr = server.local_addr();

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        wait_for(|| server.session_count() == 2).await;

        // The third connection is accepted and dropped right away
        let mut third = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 8];
        let read = timeout(WAIT, third.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        let record = timeout(WAIT, errors.recv()).await.unwrap().unwrap();
        assert_eq!(record.source, ErrorSource::Listener);
        assert!(matches!(*record.error, EngineError::PoolExhausted { capacity: 2 }));

        // Existing sessions are unaffected
        for stream in [&mut first, &mut second] {
            stream.write_all(b"ECHO ok\r\n").await.unwrap();
            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(&reply, b"ok\r\n");
        }

        // A freed proxy is reused
        drop(first);
        wait_for(|| server.session_count() == 1).await;
        wait_for(|| server.server_status().available_proxies == 1).await;
        let mut fourth = TcpStream::connect(addr).await.unwrap();
        fourth.write_all(b"ECHO again\r\n").await.unwrap();
        let mut reply = [0u8; 7];
        fourth.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"again\r\n");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_session_and_shutdown() {
        let server = start_line_server(4).await;
        let addr = server.local_addr();

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        wait_for(|| server.session_count() == 2).await;

        let ids = server.session_ids();
        assert!(server.close_session(ids[0]));
        assert!(!server.close_session(SessionId::new(999)));

        let mut buf = [0u8; 8];
        assert_eq!(timeout(WAIT, first.read(&mut buf)).await.unwrap().unwrap(), 0);
        wait_for(|| server.session_count() == 1).await;

        timeout(WAIT, server.shutdown()).await.unwrap();
        assert_eq!(timeout(WAIT, second.read(&mut buf)).await.unwrap().unwrap(), 0);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_framing_error_closes_only_offender() {
        let server = start_line_server(4).await;
        let mut errors = server.subscribe_errors();
        let addr = server.local_addr();

        let mut good = TcpStream::connect(addr).await.unwrap();
        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(b"ECHO \xff\xfe\r\n").await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(timeout(WAIT, bad.read(&mut buf)).await.unwrap().unwrap(), 0);
        let record = timeout(WAIT, errors.recv()).await.unwrap().unwrap();
        assert!(matches!(*record.error, EngineError::Framing(_)));

        good.write_all(b"ECHO fine\r\n").await.unwrap();
        let mut reply = [0u8; 6];
        good.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"fine\r\n");

        server.shutdown().await;
    }
}
