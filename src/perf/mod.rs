//! Performance monitor.
//!
//! A dedicated thread samples, on a fixed interval:
//! - thread-pool metrics from the tokio runtime
//! - server metrics from a `StatusProvider`
//! - process metrics (CPU, threads, working set) from `ProcessCounters`
//!
//! Each successful cycle replaces the published `StatusInfoCollection`
//! snapshot. A process counter read that still fails after one
//! re-resolution of the counter instance aborts the cycle: the failure is
//! reported on the exception channel and the previous snapshot stays in
//! place.

mod counters;
mod status;

pub use counters::{InstanceId, ProcessCounters, ProcessSample, SysinfoCounters};
pub use status::{
    KeyGroup, ServerMetadata, ServerStatus, StatusInfoCollection, StatusKey, StatusProvider,
    StatusValue,
};

use crate::error::{CounterError, EngineError};
use crate::runtime::{ErrorSource, ExceptionChannel};
use parking_lot::{Mutex, RwLock};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn, Level};

/// Thread-pool figures of one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadPoolSample {
    pub worker_threads: usize,
    pub alive_tasks: usize,
    pub global_queue_depth: usize,
    pub max_working_threads: usize,
    pub max_blocking_threads: usize,
}

/// Reads thread-pool metrics of a tokio runtime.
pub struct ThreadPoolProbe {
    handle: Option<Handle>,
    max_working_threads: usize,
    max_blocking_threads: usize,
}

impl ThreadPoolProbe {
    pub fn new(
        handle: Option<Handle>,
        max_working_threads: usize,
        max_blocking_threads: usize,
    ) -> Self {
        Self {
            handle,
            max_working_threads,
            max_blocking_threads,
        }
    }

    /// Probe the runtime the caller is running on, if any.
    pub fn current(max_working_threads: usize, max_blocking_threads: usize) -> Self {
        Self::new(
            Handle::try_current().ok(),
            max_working_threads,
            max_blocking_threads,
        )
    }

    pub fn sample(&self) -> ThreadPoolSample {
        let mut sample = ThreadPoolSample {
            max_working_threads: self.max_working_threads,
            max_blocking_threads: self.max_blocking_threads,
            ..Default::default()
        };

        if let Some(handle) = &self.handle {
            let metrics = handle.metrics();
            sample.worker_threads = metrics.num_workers();
            sample.alive_tasks = metrics.num_alive_tasks();
            sample.global_queue_depth = metrics.global_queue_depth();
        }

        sample
    }
}

/// Process counters bound to an instance identity.
struct CounterState {
    backend: Box<dyn ProcessCounters>,
    instance: Option<InstanceId>,
}

impl CounterState {
    fn new(backend: Box<dyn ProcessCounters>) -> Self {
        let mut state = Self {
            backend,
            instance: None,
        };
        state.rebind();
        state
    }

    /// Re-resolve the instance identity. Returns whether one was found.
    fn rebind(&mut self) -> bool {
        self.instance = self.backend.resolve_instance();
        match &self.instance {
            Some(instance) => debug!(%instance, "Bound process counters"),
            None => warn!("Process counter instance not found"),
        }
        self.instance.is_some()
    }

    /// Read the counters, re-resolving and retrying exactly once.
    ///
    /// `Ok(None)` means there is no instance to read from.
    fn sample(&mut self) -> Result<Option<ProcessSample>, CounterError> {
        if self.backend.exited_siblings() > 0 {
            debug!("Sibling process exited");
            self.rebind();
        }

        let first = match &self.instance {
            Some(instance) => self.backend.read(instance),
            None => return Ok(None),
        };

        match first {
            Ok(sample) => return Ok(Some(sample)),
            Err(e) => debug!(error = %e, "Counter read failed, re-resolving instance"),
        }

        if !self.rebind() {
            return Ok(None);
        }

        match &self.instance {
            Some(instance) => self.backend.read(instance).map(Some),
            None => Ok(None),
        }
    }
}

struct MonitorShared {
    counters: Mutex<Option<CounterState>>,
    snapshot: RwLock<Option<Arc<StatusInfoCollection>>>,
}

impl MonitorShared {
    fn rebind(&self) -> bool {
        match self.counters.lock().as_mut() {
            Some(counters) => counters.rebind(),
            None => false,
        }
    }
}

/// Periodic sampler of thread-pool, server and process metrics.
pub struct PerformanceMonitor {
    interval: Duration,
    metadata: ServerMetadata,
    probe: ThreadPoolProbe,
    status: Arc<dyn StatusProvider>,
    exceptions: ExceptionChannel,
    cpu_cores: usize,
    shared: Arc<MonitorShared>,
}

impl PerformanceMonitor {
    /// Create a monitor.
    ///
    /// If `counters` is an error, process metrics are left out of every
    /// snapshot.
    pub fn new(
        interval: Duration,
        metadata: ServerMetadata,
        probe: ThreadPoolProbe,
        status: Arc<dyn StatusProvider>,
        exceptions: ExceptionChannel,
        counters: Result<Box<dyn ProcessCounters>, CounterError>,
    ) -> Self {
        let counters = match counters {
            Ok(backend) => Some(CounterState::new(backend)),
            Err(e) => {
                warn!(error = %e, "Process counters unavailable, reporting without process metrics");
                None
            }
        };

        let cpu_cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            interval,
            metadata,
            probe,
            status,
            exceptions,
            cpu_cores,
            shared: Arc::new(MonitorShared {
                counters: Mutex::new(counters),
                snapshot: RwLock::new(None),
            }),
        }
    }

    /// Override the logical processor count used to normalize CPU usage.
    pub fn with_cpu_cores(mut self, cores: usize) -> Self {
        self.cpu_cores = cores.max(1);
        self
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Option<Arc<StatusInfoCollection>> {
        self.shared.snapshot.read().clone()
    }

    /// Run one sampling cycle and publish its snapshot.
    ///
    /// Returns `None` if the cycle was aborted by a counter read failure.
    pub fn collect(&self) -> Option<Arc<StatusInfoCollection>> {
        let mut status = StatusInfoCollection::new();

        let pool = self.probe.sample();
        self.put(&mut status, StatusKey::WorkerThreads, pool.worker_threads);
        self.put(&mut status, StatusKey::AliveTasks, pool.alive_tasks);
        self.put(&mut status, StatusKey::GlobalQueueDepth, pool.global_queue_depth);
        self.put(&mut status, StatusKey::MaxWorkingThreads, pool.max_working_threads);
        self.put(&mut status, StatusKey::MaxBlockingThreads, pool.max_blocking_threads);

        if !self.metadata.is_server_manager() {
            let server = self.status.server_status();
            self.put(&mut status, StatusKey::IsRunning, server.is_running);
            self.put(&mut status, StatusKey::SessionCount, server.session_count);
            self.put(&mut status, StatusKey::AvailableProxies, server.available_proxies);
            self.put(&mut status, StatusKey::AcceptedConnections, server.accepted_connections);
            self.put(&mut status, StatusKey::HandledRequests, server.handled_requests);
        }

        let process = match self.shared.counters.lock().as_mut() {
            Some(counters) => counters.sample(),
            None => Ok(None),
        };

        match process {
            Ok(Some(sample)) => {
                let cpu = sample.cpu_percent / self.cpu_cores as f64;
                self.put(&mut status, StatusKey::CpuUsage, cpu);
                self.put(&mut status, StatusKey::MemoryUsage, sample.working_set);
                if let Some(threads) = sample.thread_count {
                    self.put(&mut status, StatusKey::TotalThreadCount, threads);
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.exceptions
                    .report(ErrorSource::PerformanceMonitor, EngineError::CounterRead(e));
                return None;
            }
        }

        let snapshot = Arc::new(status);
        *self.shared.snapshot.write() = Some(Arc::clone(&snapshot));

        if tracing::enabled!(target: "perf", Level::INFO) {
            info!(target: "perf", "{}", snapshot);
        }

        Some(snapshot)
    }

    fn put(&self, status: &mut StatusInfoCollection, key: StatusKey, value: impl Into<StatusValue>) {
        if self.metadata.exposes(key) {
            status.insert(key, value.into());
        }
    }

    /// Start sampling on a dedicated thread.
    pub fn start(self) -> std::io::Result<MonitorHandle> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);

        let thread = thread::Builder::new()
            .name("perf-monitor".to_string())
            .spawn(move || self.run(stop_rx))?;

        Ok(MonitorHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
            shared,
        })
    }

    fn run(self, stop: mpsc::Receiver<()>) {
        info!(interval = ?self.interval, "Performance monitor started");

        loop {
            match stop.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => {
                    self.collect();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!("Performance monitor stopped");
    }
}

/// Control handle of a running monitor. Dropping it stops the monitor.
pub struct MonitorHandle {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    shared: Arc<MonitorShared>,
}

impl MonitorHandle {
    /// Latest published snapshot.
    pub fn snapshot(&self) -> Option<Arc<StatusInfoCollection>> {
        self.shared.snapshot.read().clone()
    }

    /// A same-named sibling process exited; re-resolve the counter instance.
    pub fn notify_sibling_exit(&self) -> bool {
        self.shared.rebind()
    }

    /// Stop the sampling thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Performance monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
