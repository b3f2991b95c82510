//! System memory sampling for the session memory caps.

use crate::error::MemoryError;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

/// Totals read from `/proc/meminfo`, in kB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total_kb: u64,
    /// Kernel estimate of memory available for new allocations
    pub available_kb: u64,
}

impl MemoryInfo {
    pub fn parse(content: &str) -> Result<Self, MemoryError> {
        let fields: HashMap<&str, u64> = content
            .lines()
            .filter_map(|line| {
                let (key, value) = line.split_once(':')?;
                let kb = value.trim().trim_end_matches("kB").trim().parse().ok()?;
                Some((key, kb))
            })
            .collect();

        let total_kb = *fields.get("MemTotal").ok_or(MemoryError::MissingField("MemTotal"))?;

        // Kernels before 3.14 lack MemAvailable
        let available_kb = match fields.get("MemAvailable") {
            Some(kb) => *kb,
            None => {
                let free = *fields.get("MemFree").ok_or(MemoryError::MissingField("MemFree"))?;
                debug!("MemAvailable missing, estimating from free, buffers and cache");
                free + fields.get("Buffers").copied().unwrap_or(0) + fields.get("Cached").copied().unwrap_or(0)
            }
        };

        Ok(Self { total_kb, available_kb })
    }

    /// Share of memory in use, 0 to 100.
    pub fn used_percent(&self) -> f64 {
        if self.total_kb == 0 {
            return 0.0;
        }
        let used = self.total_kb.saturating_sub(self.available_kb);
        used as f64 * 100.0 / self.total_kb as f64
    }
}

/// Where the manager reads memory usage from.
pub trait MemorySource: Send {
    fn sample(&mut self) -> Result<MemoryInfo, MemoryError>;
}

/// Reads the host's `/proc/meminfo`.
#[derive(Debug, Clone)]
pub struct ProcMeminfo {
    path: PathBuf,
}

impl Default for ProcMeminfo {
    fn default() -> Self {
        Self { path: PathBuf::from("/proc/meminfo") }
    }
}

impl ProcMeminfo {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MemorySource for ProcMeminfo {
    fn sample(&mut self) -> Result<MemoryInfo, MemoryError> {
        let content = std::fs::read_to_string(&self.path)?;
        MemoryInfo::parse(&content)
    }
}
