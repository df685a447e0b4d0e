//! Linux `/proc` signal sources.
//!
//! Each source reads a small text file on every sample. On platforms
//! without procfs the read fails and the sampler falls back to a neutral
//! value, so these sources are safe to configure unconditionally.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sensoflow_signals::{ProcCpu, ProcMemory, SignalSource};
//!
//! let cpu = ProcCpu::new();
//! let memory = ProcMemory::new();
//!
//! // The first CPU sample only primes the delta.
//! let _ = cpu.sample();
//! println!("memory pressure: {:?}", memory.sample());
//! ```

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::{clamp_pressure, SignalError, SignalSource};

fn read(source_name: &'static str, path: &Path) -> Result<String, SignalError> {
    std::fs::read_to_string(path).map_err(|error| SignalError::Io { source_name, error })
}

// ============================================================================
// CPU
// ============================================================================

/// Aggregate CPU jiffies from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
}

/// Parse the aggregate `cpu` line of `/proc/stat`.
pub fn parse_proc_stat(content: &str) -> Result<CpuTimes, SignalError> {
    let line = content
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or_else(|| SignalError::parse("cpu", "no aggregate cpu line"))?;

    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|field| field.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|e| SignalError::parse("cpu", e.to_string()))?;

    if fields.len() < 4 {
        return Err(SignalError::parse("cpu", "too few fields"));
    }

    // user nice system idle iowait irq softirq steal ...
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total = fields.iter().take(8).sum();

    Ok(CpuTimes { idle, total })
}

/// CPU busy fraction since the previous sample.
#[derive(Debug)]
pub struct ProcCpu {
    path: PathBuf,
    previous: Mutex<Option<CpuTimes>>,
}

impl ProcCpu {
    pub fn new() -> Self {
        Self::with_path("/proc/stat")
    }

    /// Read from an alternative file (used by tests and containers that
    /// mount host procfs elsewhere).
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            previous: Mutex::new(None),
        }
    }
}

impl Default for ProcCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalSource for ProcCpu {
    fn name(&self) -> &str {
        "cpu"
    }

    fn sample(&self) -> Result<f64, SignalError> {
        let current = parse_proc_stat(&read("cpu", &self.path)?)?;
        let previous = self.previous.lock().replace(current);

        let Some(previous) = previous else {
            return Err(SignalError::Unavailable("cpu delta not primed".to_string()));
        };

        let total = current.total.saturating_sub(previous.total);
        if total == 0 {
            return Err(SignalError::Unavailable("no cpu time elapsed".to_string()));
        }
        let idle = current.idle.saturating_sub(previous.idle);

        Ok(clamp_pressure(1.0 - idle as f64 / total as f64))
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Parse `/proc/meminfo` into a used-memory fraction.
pub fn parse_meminfo(content: &str) -> Result<f64, SignalError> {
    let mut total = None;
    let mut available = None;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next();
        let value = parts.next().and_then(|v| v.parse::<u64>().ok());
        match key {
            Some("MemTotal:") => total = value,
            Some("MemAvailable:") => available = value,
            _ => {}
        }
    }

    match (total, available) {
        (Some(total), Some(available)) if total > 0 => {
            Ok(clamp_pressure(1.0 - available as f64 / total as f64))
        }
        (Some(0), _) => Err(SignalError::parse("memory", "MemTotal is zero")),
        _ => Err(SignalError::parse("memory", "missing MemTotal or MemAvailable")),
    }
}

/// Memory pressure from `/proc/meminfo`.
#[derive(Debug)]
pub struct ProcMemory {
    path: PathBuf,
}

impl ProcMemory {
    pub fn new() -> Self {
        Self::with_path("/proc/meminfo")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalSource for ProcMemory {
    fn name(&self) -> &str {
        "memory"
    }

    fn sample(&self) -> Result<f64, SignalError> {
        parse_meminfo(&read("memory", &self.path)?)
    }
}

// ============================================================================
// Run queue
// ============================================================================

/// Parse the 1-minute load average from `/proc/loadavg`.
pub fn parse_loadavg(content: &str) -> Result<f64, SignalError> {
    content
        .split_whitespace()
        .next()
        .ok_or_else(|| SignalError::parse("run_queue", "empty loadavg"))?
        .parse::<f64>()
        .map_err(|e| SignalError::parse("run_queue", e.to_string()))
}

/// Run-queue pressure: 1-minute load average divided by core count.
#[derive(Debug)]
pub struct ProcRunQueue {
    path: PathBuf,
    cores: usize,
}

impl ProcRunQueue {
    pub fn new() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            path: PathBuf::from("/proc/loadavg"),
            cores,
        }
    }

    pub fn with_path(path: impl Into<PathBuf>, cores: usize) -> Self {
        Self {
            path: path.into(),
            cores: cores.max(1),
        }
    }
}

impl Default for ProcRunQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalSource for ProcRunQueue {
    fn name(&self) -> &str {
        "run_queue"
    }

    fn sample(&self) -> Result<f64, SignalError> {
        let load = parse_loadavg(&read("run_queue", &self.path)?)?;
        Ok(clamp_pressure(load / self.cores as f64))
    }
}
