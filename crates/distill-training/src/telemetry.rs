//! Best-effort resource telemetry.
//!
//! Probes return `None` whenever they cannot measure; callers only ever copy
//! the snapshot into a progress event.

use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram_rss_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram_vms_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_mem_allocated_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_mem_reserved_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuDevice {
    pub index: usize,
    pub name: String,
    pub total_memory_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GpuInfo {
    pub available: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gpus: Vec<GpuDevice>,
}

pub trait ResourceProbe: Send {
    fn snapshot(&mut self) -> Option<ResourceSnapshot>;

    /// GPUs visible to the job. The default reports none.
    fn gpu_info(&self) -> GpuInfo {
        GpuInfo::default()
    }
}

/// Process CPU and memory via `sysinfo`.
pub struct SysinfoProbe {
    system: System,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    #[must_use]
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            tracing::debug!("current pid unavailable; resource telemetry disabled");
        }
        Self { system: System::new(), pid }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn snapshot(&mut self) -> Option<ResourceSnapshot> {
        let pid = self.pid?;
        self.system.refresh_memory();
        self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process = self.system.process(pid)?;
        Some(ResourceSnapshot {
            cpu_percent: Some(f64::from(process.cpu_usage())),
            ram_rss_bytes: Some(process.memory()),
            ram_vms_bytes: Some(process.virtual_memory()),
            ..ResourceSnapshot::default()
        })
    }
}

/// Reports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProbe;

impl ResourceProbe for NullProbe {
    fn snapshot(&mut self) -> Option<ResourceSnapshot> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_probe() {
        assert!(NullProbe.snapshot().is_none());
        assert!(!NullProbe.gpu_info().available);
    }

    #[test]
    fn test_empty_snapshot_serializes_to_empty_object() {
        let json = serde_json::to_value(ResourceSnapshot::default()).unwrap();
        assert_eq!(json, serde_json::json!({}));
        let gpu = serde_json::to_value(GpuInfo::default()).unwrap();
        assert_eq!(gpu, serde_json::json!({"available": false}));
    }

    #[test]
    fn test_sysinfo_probe_reports_memory() {
        let mut probe = SysinfoProbe::new();
        if let Some(snapshot) = probe.snapshot() {
            assert!(snapshot.ram_rss_bytes.unwrap_or(0) > 0);
        }
    }

    #[test]
    fn test_sysinfo_probe_refreshes_own_process_and_memory() {
        let mut probe = SysinfoProbe::new();
        let Some(pid) = probe.pid else { return };
        if probe.snapshot().is_none() {
            return;
        }
        assert!(probe.system.process(pid).is_some());
        assert!(probe.system.total_memory() > 0);
    }
}
