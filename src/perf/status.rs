//! Status keys, values and the snapshot collection.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Where a status key's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyGroup {
    ThreadPool,
    Process,
    Server,
}

/// A metric exposed in the status collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatusKey {
    WorkerThreads,
    AliveTasks,
    GlobalQueueDepth,
    MaxWorkingThreads,
    MaxBlockingThreads,
    TotalThreadCount,
    CpuUsage,
    MemoryUsage,
    IsRunning,
    SessionCount,
    AvailableProxies,
    AcceptedConnections,
    HandledRequests,
}

impl StatusKey {
    pub const ALL: [StatusKey; 13] = [
        StatusKey::WorkerThreads,
        StatusKey::AliveTasks,
        StatusKey::GlobalQueueDepth,
        StatusKey::MaxWorkingThreads,
        StatusKey::MaxBlockingThreads,
        StatusKey::TotalThreadCount,
        StatusKey::CpuUsage,
        StatusKey::MemoryUsage,
        StatusKey::IsRunning,
        StatusKey::SessionCount,
        StatusKey::AvailableProxies,
        StatusKey::AcceptedConnections,
        StatusKey::HandledRequests,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKey::WorkerThreads => "worker_threads",
            StatusKey::AliveTasks => "alive_tasks",
            StatusKey::GlobalQueueDepth => "global_queue_depth",
            StatusKey::MaxWorkingThreads => "max_working_threads",
            StatusKey::MaxBlockingThreads => "max_blocking_threads",
            StatusKey::TotalThreadCount => "total_thread_count",
            StatusKey::CpuUsage => "cpu_usage",
            StatusKey::MemoryUsage => "memory_usage",
            StatusKey::IsRunning => "is_running",
            StatusKey::SessionCount => "session_count",
            StatusKey::AvailableProxies => "available_proxies",
            StatusKey::AcceptedConnections => "accepted_connections",
            StatusKey::HandledRequests => "handled_requests",
        }
    }

    pub fn group(&self) -> KeyGroup {
        match self {
            StatusKey::WorkerThreads
            | StatusKey::AliveTasks
            | StatusKey::GlobalQueueDepth
            | StatusKey::MaxWorkingThreads
            | StatusKey::MaxBlockingThreads => KeyGroup::ThreadPool,
            StatusKey::TotalThreadCount | StatusKey::CpuUsage | StatusKey::MemoryUsage => {
                KeyGroup::Process
            }
            StatusKey::IsRunning
            | StatusKey::SessionCount
            | StatusKey::AvailableProxies
            | StatusKey::AcceptedConnections
            | StatusKey::HandledRequests => KeyGroup::Server,
        }
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sampled metric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusValue {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<u64> for StatusValue {
    fn from(v: u64) -> Self {
        StatusValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for StatusValue {
    fn from(v: usize) -> Self {
        StatusValue::from(v as u64)
    }
}

impl From<f64> for StatusValue {
    fn from(v: f64) -> Self {
        StatusValue::Float(v)
    }
}

impl From<bool> for StatusValue {
    fn from(v: bool) -> Self {
        StatusValue::Bool(v)
    }
}

impl fmt::Display for StatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusValue::Int(v) => write!(f, "{v}"),
            StatusValue::Float(v) => write!(f, "{v:.2}"),
            StatusValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// One published sample of all exposed metrics.
#[derive(Debug, Clone)]
pub struct StatusInfoCollection {
    values: BTreeMap<StatusKey, StatusValue>,
    collected_at: DateTime<Utc>,
}

impl Default for StatusInfoCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusInfoCollection {
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
            collected_at: Utc::now(),
        }
    }

    pub fn insert(&mut self, key: StatusKey, value: StatusValue) {
        self.values.insert(key, value);
    }

    pub fn get(&self, key: StatusKey) -> Option<&StatusValue> {
        self.values.get(&key)
    }

    pub fn contains(&self, key: StatusKey) -> bool {
        self.values.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StatusKey, StatusValue)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }

    pub fn collected_at(&self) -> DateTime<Utc> {
        self.collected_at
    }
}

impl fmt::Display for StatusInfoCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.collected_at.format("%Y-%m-%d %H:%M:%S"))?;
        for (key, value) in &self.values {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}

/// Which status keys a server variant exposes.
#[derive(Debug, Clone)]
pub struct ServerMetadata {
    status_keys: Vec<StatusKey>,
    is_server_manager: bool,
}

impl ServerMetadata {
    pub fn new(status_keys: Vec<StatusKey>, is_server_manager: bool) -> Self {
        Self {
            status_keys,
            is_server_manager,
        }
    }

    /// A regular server: every key.
    pub fn server() -> Self {
        Self::new(StatusKey::ALL.to_vec(), false)
    }

    /// A server manager: thread-pool and process keys only.
    pub fn manager() -> Self {
        let keys = StatusKey::ALL
            .into_iter()
            .filter(|key| key.group() != KeyGroup::Server)
            .collect();
        Self::new(keys, true)
    }

    pub fn status_keys(&self) -> &[StatusKey] {
        &self.status_keys
    }

    pub fn is_server_manager(&self) -> bool {
        self.is_server_manager
    }

    pub fn exposes(&self, key: StatusKey) -> bool {
        if self.is_server_manager && key.group() == KeyGroup::Server {
            return false;
        }
        self.status_keys.contains(&key)
    }
}

/// Server-level figures sampled by the monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStatus {
    pub is_running: bool,
    pub session_count: usize,
    pub available_proxies: usize,
    pub accepted_connections: u64,
    pub handled_requests: u64,
}

/// Source of server-level status.
pub trait StatusProvider: Send + Sync + 'static {
    fn server_status(&self) -> ServerStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names_unique() {
        let mut names: Vec<&str> = StatusKey::ALL.iter().map(StatusKey::as_str).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), StatusKey::ALL.len());
    }

    #[test]
    fn test_manager_metadata() {
        let manager = ServerMetadata::manager();
        assert!(manager.is_server_manager());
        assert!(manager.exposes(StatusKey::CpuUsage));
        assert!(!manager.exposes(StatusKey::SessionCount));

        // Server keys stay hidden even if listed explicitly
        let custom = ServerMetadata::new(vec![StatusKey::SessionCount], true);
        assert!(!custom.exposes(StatusKey::SessionCount));
    }

    #[test]
    fn test_collection_display() {
        let mut status = StatusInfoCollection::new();
        status.insert(StatusKey::CpuUsage, 12.5.into());
        status.insert(StatusKey::SessionCount, 3usize.into());
        status.insert(StatusKey::IsRunning, true.into());

        let text = status.to_string();
        assert!(text.ends_with(" cpu_usage=12.50 is_running=true session_count=3"));
        assert_eq!(status.len(), 3);
    }
}
