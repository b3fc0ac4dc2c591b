//! OS-level process counters.
//!
//! Counters are addressed through an `InstanceId`. The identity can go stale
//! at runtime (for example when a same-named sibling process exits), so
//! callers re-resolve it through `ProcessCounters::resolve_instance` and
//! retry.

use crate::error::CounterError;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fmt;
use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Identity that process counters are bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One raw reading of the process counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSample {
    /// CPU usage summed over all cores (may exceed 100).
    pub cpu_percent: f64,
    /// OS threads of the process, where the platform reports them.
    pub thread_count: Option<u64>,
    /// Resident memory in bytes.
    pub working_set: u64,
}

/// Backend for process-level metrics.
pub trait ProcessCounters: Send + 'static {
    /// Resolve the identity of the current process. `None` means the
    /// process can no longer be found.
    fn resolve_instance(&mut self) -> Option<InstanceId>;

    /// Read the counters bound to `instance`.
    fn read(&mut self, instance: &InstanceId) -> Result<ProcessSample, CounterError>;

    /// Number of same-named sibling processes that exited since the last call.
    fn exited_siblings(&mut self) -> usize {
        0
    }
}

/// `sysinfo` backed counters for the current process.
pub struct SysinfoCounters {
    system: System,
    pid: Pid,
    name: String,
    siblings: HashSet<Pid>,
}

impl SysinfoCounters {
    /// Bind to the current process.
    pub fn new() -> Result<Self, CounterError> {
        let pid = get_current_pid().map_err(|e| CounterError::Unavailable(e.to_string()))?;

        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::everything(),
        );

        let name = system
            .process(pid)
            .map(|process| process.name().to_string_lossy().into_owned())
            .ok_or_else(|| CounterError::Unavailable(format!("process {pid} not visible")))?;

        let mut counters = Self {
            system,
            pid,
            name,
            siblings: HashSet::new(),
        };
        counters.siblings = counters.same_name_processes();
        Ok(counters)
    }

    fn same_name_processes(&mut self) -> HashSet<Pid> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );

        let own = self.pid;
        self.system
            .processes_by_exact_name(OsStr::new(&self.name))
            .map(|process| process.pid())
            .filter(|&pid| pid != own)
            .collect()
    }

    fn refresh_own(&mut self) -> bool {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::everything(),
        ) > 0
    }
}

impl ProcessCounters for SysinfoCounters {
    fn resolve_instance(&mut self) -> Option<InstanceId> {
        if !self.refresh_own() {
            return None;
        }

        let process = self.system.process(self.pid)?;
        self.name = process.name().to_string_lossy().into_owned();
        Some(InstanceId::new(format!("{}/{}", self.pid, self.name)))
    }

    fn read(&mut self, instance: &InstanceId) -> Result<ProcessSample, CounterError> {
        if !self.refresh_own() {
            return Err(CounterError::InstanceGone(instance.to_string()));
        }

        let process = self
            .system
            .process(self.pid)
            .ok_or_else(|| CounterError::InstanceGone(instance.to_string()))?;

        let cpu = process.cpu_usage();
        if !cpu.is_finite() {
            return Err(CounterError::Read(format!("invalid cpu usage {cpu}")));
        }

        Ok(ProcessSample {
            cpu_percent: f64::from(cpu),
            thread_count: process.tasks().map(|tasks| tasks.len() as u64),
            working_set: process.memory(),
        })
    }

    fn exited_siblings(&mut self) -> usize {
        let current = self.same_name_processes();
        let exited = self.siblings.difference(&current).count();
        self.siblings = current;
        exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_display() {
        let id = InstanceId::new("42/socket-engine");
        assert_eq!(id.to_string(), "42/socket-engine");
        assert_eq!(id.as_str(), "42/socket-engine");
    }

    #[test]
    fn test_sysinfo_counters_for_current_process() {
        // Hosts without process information are allowed to refuse.
        let Ok(mut counters) = SysinfoCounters::new() else {
            return;
        };

        let instance = counters.resolve_instance().unwrap();
        let pid = std::process::id().to_string();
        assert!(instance.as_str().starts_with(&format!("{pid}/")));

        let sample = counters.read(&instance).unwrap();
        assert!(sample.working_set > 0);
        assert!(sample.cpu_percent >= 0.0);
    }
}
