//! Host and per-process resource sampling.
//!
//! CPU percentages are measured over a ≥500 ms window so they reflect
//! steady-state load rather than an instantaneous spike. GPU metrics
//! are opportunistic: when NVML cannot initialise the capability is
//! logged once and disabled, never surfaced as a job error.

use std::sync::Mutex;
use std::time::Duration;

use nvml_wrapper::Nvml;
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use serde::Serialize;
use sysinfo::{Pid, System};
use tracing::{debug, warn};

use crate::db::Database;
use crate::sync_ext::MutexExt;

/// Sampling window for host CPU percentages.
const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub total_mb: f64,
    pub used_mb: f64,
    pub available_mb: f64,
    pub percent: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiskIoCounters {
    pub read_bytes: u64,
    pub written_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuStats {
    pub index: u32,
    pub name: String,
    pub utilization_percent: u32,
    pub memory_percent: u32,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub temperature_c: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostSnapshot {
    pub cpu_percent: f32,
    pub per_core: Vec<f32>,
    pub memory: MemorySnapshot,
    pub disk_io: DiskIoCounters,
    /// `None` when GPU monitoring is unavailable on this host.
    pub gpus: Option<Vec<GpuStats>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub status: String,
}

/// Soft throttling thresholds; only `should_pause` is actionable.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub cpu_threshold: f32,
    pub memory_threshold: f32,
    pub gpu_threshold: f32,
    pub nice_level: i32,
    pub enable_throttling: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_threshold: 90.0,
            memory_threshold: 85.0,
            gpu_threshold: 90.0,
            nice_level: 10,
            enable_throttling: true,
        }
    }
}

impl ResourceLimits {
    /// Load the `resource_*` settings rows, falling back to defaults
    /// for anything missing or unparseable.
    pub fn from_settings(db: &Database) -> Self {
        let mut limits = Self::default();
        let rows = match db.settings_with_prefix("resource_") {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "could not load resource settings; using defaults");
                return limits;
            }
        };
        for (key, value) in rows {
            match key.as_str() {
                "resource_cpu_threshold" => {
                    limits.cpu_threshold = value.parse().unwrap_or(limits.cpu_threshold)
                }
                "resource_memory_threshold" => {
                    limits.memory_threshold = value.parse().unwrap_or(limits.memory_threshold)
                }
                "resource_gpu_threshold" => {
                    limits.gpu_threshold = value.parse().unwrap_or(limits.gpu_threshold)
                }
                "resource_nice_level" => {
                    limits.nice_level = value.parse().unwrap_or(limits.nice_level)
                }
                "resource_enable_throttling" => {
                    limits.enable_throttling = value.eq_ignore_ascii_case("true")
                }
                _ => {}
            }
        }
        limits
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdReport {
    pub cpu_exceeded: bool,
    pub memory_exceeded: bool,
    pub gpu_exceeded: bool,
    pub should_pause: bool,
    pub cpu_usage: f32,
    pub memory_usage: f32,
    pub gpu_usage: Option<u32>,
    pub reason: String,
}

enum NvmlState {
    Untried,
    Unavailable,
    Ready(Nvml),
}

pub struct ResourceMonitor {
    system: Mutex<System>,
    nvml: Mutex<NvmlState>,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor").finish_non_exhaustive()
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor {
    pub fn new() -> Self {
        // Warm the sysinfo baselines once so the first real sample is
        // already a delta, not initialization noise.
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            nvml: Mutex::new(NvmlState::Untried),
        }
    }

    /// Full host snapshot. Blocks for the CPU sampling window.
    pub fn host_snapshot(&self) -> HostSnapshot {
        let mut sys = self.system.lock_unpoisoned();
        sys.refresh_cpu_usage();
        std::thread::sleep(CPU_SAMPLE_WINDOW.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL));
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        sys.refresh_processes();

        let per_core: Vec<f32> = sys.cpus().iter().map(|c| c.cpu_usage()).collect();
        let cpu_percent = if per_core.is_empty() {
            0.0
        } else {
            per_core.iter().copied().sum::<f32>() / per_core.len() as f32
        };

        let total = sys.total_memory();
        let used = sys.used_memory();
        let memory = MemorySnapshot {
            total_mb: total as f64 / (1024.0 * 1024.0),
            used_mb: used as f64 / (1024.0 * 1024.0),
            available_mb: sys.available_memory() as f64 / (1024.0 * 1024.0),
            percent: if total > 0 {
                (used as f64 / total as f64 * 100.0) as f32
            } else {
                0.0
            },
        };

        let mut disk_io = DiskIoCounters::default();
        for process in sys.processes().values() {
            let usage = process.disk_usage();
            disk_io.read_bytes = disk_io.read_bytes.saturating_add(usage.total_read_bytes);
            disk_io.written_bytes = disk_io.written_bytes.saturating_add(usage.total_written_bytes);
        }
        drop(sys);

        HostSnapshot {
            cpu_percent,
            per_core,
            memory,
            disk_io,
            gpus: self.gpu_stats(),
        }
    }

    /// Resource usage of one process, or `None` once it has exited.
    pub fn process_snapshot(&self, pid: u32) -> Option<ProcessSnapshot> {
        let pid = Pid::from_u32(pid);
        let mut sys = self.system.lock_unpoisoned();
        if !sys.refresh_process(pid) {
            return None;
        }
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        if !sys.refresh_process(pid) {
            return None;
        }
        let process = sys.process(pid)?;
        Some(ProcessSnapshot {
            pid: pid.as_u32(),
            cpu_percent: process.cpu_usage(),
            memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
            status: process.status().to_string(),
        })
    }

    fn gpu_stats(&self) -> Option<Vec<GpuStats>> {
        let mut state = self.nvml.lock_unpoisoned();
        if matches!(*state, NvmlState::Untried) {
            *state = match Nvml::init() {
                Ok(nvml) => NvmlState::Ready(nvml),
                Err(err) => {
                    // Degraded capability: say so once and move on.
                    warn!(error = %err, "GPU monitoring unavailable");
                    NvmlState::Unavailable
                }
            };
        }
        let NvmlState::Ready(nvml) = &*state else {
            return None;
        };

        let count = nvml.device_count().ok()?;
        let mut stats = Vec::with_capacity(count as usize);
        for index in 0..count {
            let Ok(device) = nvml.device_by_index(index) else {
                continue;
            };
            let Ok(util) = device.utilization_rates() else {
                continue;
            };
            let Ok(memory) = device.memory_info() else {
                continue;
            };
            let memory_percent = if memory.total > 0 {
                ((memory.used as f64 / memory.total as f64) * 100.0).round() as u32
            } else {
                0
            };
            stats.push(GpuStats {
                index,
                name: device.name().unwrap_or_else(|_| "unknown".to_string()),
                utilization_percent: util.gpu,
                memory_percent,
                memory_used_mb: memory.used as f64 / (1024.0 * 1024.0),
                memory_total_mb: memory.total as f64 / (1024.0 * 1024.0),
                temperature_c: device.temperature(TemperatureSensor::Gpu).ok(),
            });
        }
        Some(stats)
    }

    /// Compare a fresh snapshot against soft thresholds. The reason
    /// string names every exceeded resource.
    pub fn threshold_check(&self, limits: &ResourceLimits) -> ThresholdReport {
        let snapshot = self.host_snapshot();
        let cpu_exceeded = snapshot.cpu_percent > limits.cpu_threshold;
        let memory_exceeded = snapshot.memory.percent > limits.memory_threshold;

        let gpu_usage = snapshot
            .gpus
            .as_ref()
            .and_then(|gpus| gpus.iter().map(|g| g.utilization_percent).max());
        let gpu_exceeded = gpu_usage
            .map(|usage| usage as f32 > limits.gpu_threshold)
            .unwrap_or(false);

        let mut reasons = Vec::new();
        if cpu_exceeded {
            reasons.push(format!(
                "CPU usage {:.1}% exceeds threshold {:.0}%",
                snapshot.cpu_percent, limits.cpu_threshold
            ));
        }
        if memory_exceeded {
            reasons.push(format!(
                "Memory usage {:.1}% exceeds threshold {:.0}%",
                snapshot.memory.percent, limits.memory_threshold
            ));
        }
        if gpu_exceeded {
            if let Some(usage) = gpu_usage {
                reasons.push(format!(
                    "GPU usage {usage}% exceeds threshold {:.0}%",
                    limits.gpu_threshold
                ));
            }
        }

        let should_pause = cpu_exceeded || memory_exceeded || gpu_exceeded;
        if should_pause {
            debug!(reason = %reasons.join("; "), "threshold check tripped");
        }

        ThresholdReport {
            cpu_exceeded,
            memory_exceeded,
            gpu_exceeded,
            should_pause,
            cpu_usage: snapshot.cpu_percent,
            memory_usage: snapshot.memory.percent,
            gpu_usage,
            reason: reasons.join("; "),
        }
    }
}
