use anyhow::{anyhow, Context, Result};
use nvml_wrapper::Nvml;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Snapshot of one device, taken fresh on every allocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuState {
    pub index: u32,
    pub free_memory_mb: u64,
    pub active_processes: usize,
}

/// Source of memory, CPU and GPU occupancy figures.
///
/// Calls may block (CPU utilization is sampled over a window), so async
/// callers go through `spawn_blocking`.
#[cfg_attr(test, mockall::automock)]
pub trait ResourceProbe: Send + Sync {
    fn available_memory_gb(&self) -> Result<f64>;
    fn cpu_utilization_percent(&self) -> Result<f64>;
    fn list_gpus(&self) -> Result<Vec<GpuState>>;
}

/// Probe backed by `/proc` and NVML.
pub struct SystemProbe {
    nvml: Option<Nvml>,
    cpu_sample: Duration,
}

impl SystemProbe {
    pub fn new(cpu_sample: Duration) -> Self {
        // Keep running without GPU support when the driver is missing
        let nvml = match Nvml::init() {
            Ok(nvml) => Some(nvml),
            Err(e) => {
                tracing::warn!("Failed to initialize NVML: {}. GPU listing disabled.", e);
                None
            }
        };
        Self { nvml, cpu_sample }
    }
}

impl ResourceProbe for SystemProbe {
    fn available_memory_gb(&self) -> Result<f64> {
        let content =
            std::fs::read_to_string("/proc/meminfo").context("Failed to read /proc/meminfo")?;
        let kb = parse_meminfo_available_kb(&content)
            .ok_or_else(|| anyhow!("MemAvailable not found in /proc/meminfo"))?;
        Ok(kb as f64 / (1024.0 * 1024.0))
    }

    fn cpu_utilization_percent(&self) -> Result<f64> {
        let first = read_cpu_times()?;
        std::thread::sleep(self.cpu_sample);
        let second = read_cpu_times()?;
        Ok(first.utilization_until(&second))
    }

    fn list_gpus(&self) -> Result<Vec<GpuState>> {
        let nvml = self
            .nvml
            .as_ref()
            .ok_or_else(|| anyhow!("NVML is not available"))?;
        let count = nvml.device_count().context("Failed to count GPUs")?;
        let mut gpus = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = nvml
                .device_by_index(index)
                .with_context(|| format!("Failed to open GPU {index}"))?;
            let memory = device
                .memory_info()
                .with_context(|| format!("Failed to read memory of GPU {index}"))?;
            let processes = device
                .running_compute_processes()
                .with_context(|| format!("Failed to list processes on GPU {index}"))?;
            gpus.push(GpuState {
                index,
                free_memory_mb: memory.free / (1024 * 1024),
                active_processes: processes.len(),
            });
        }
        Ok(gpus)
    }
}

/// `MemAvailable:   32864256 kB` -> 32864256
fn parse_meminfo_available_kb(content: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

impl CpuTimes {
    fn utilization_until(&self, later: &CpuTimes) -> f64 {
        let total = later.total.saturating_sub(self.total);
        if total == 0 {
            return 0.0;
        }
        let idle = later.idle.saturating_sub(self.idle);
        100.0 * (total - idle.min(total)) as f64 / total as f64
    }
}

fn read_cpu_times() -> Result<CpuTimes> {
    let content = std::fs::read_to_string("/proc/stat").context("Failed to read /proc/stat")?;
    parse_cpu_times(&content).ok_or_else(|| anyhow!("Aggregate cpu line not found in /proc/stat"))
}

/// Parses the aggregate `cpu` line; idle time includes iowait.
fn parse_cpu_times(content: &str) -> Option<CpuTimes> {
    let line = content.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}
