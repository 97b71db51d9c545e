//! System memory probing for the load gate.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Point-in-time memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MemorySnapshot {
    /// Percentage of memory in use (0-100).
    pub used_percent: f64,
    pub available_gb: f64,
}

/// Source of memory usage readings.
pub trait MemoryProbe: Send + Sync {
    fn snapshot(&self) -> MemorySnapshot;
}

/// Reads `MemTotal` and `MemAvailable` from `/proc/meminfo`.
///
/// Reports zero usage when the file cannot be read, so hosts without procfs
/// never trip the memory gate.
pub struct ProcMemInfo {
    path: PathBuf,
}

impl ProcMemInfo {
    pub fn new() -> Self {
        Self::with_path("/proc/meminfo")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMemInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcMemInfo {
    fn snapshot(&self) -> MemorySnapshot {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => parse_meminfo(&contents).unwrap_or_default(),
            Err(e) => {
                tracing::debug!("Cannot read {}: {}", self.path.display(), e);
                MemorySnapshot::default()
            }
        }
    }
}

fn parse_meminfo(contents: &str) -> Option<MemorySnapshot> {
    let mut total_kb = None;
    let mut available_kb = None;
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("MemTotal:") => total_kb = fields.next()?.parse::<u64>().ok(),
            Some("MemAvailable:") => available_kb = fields.next()?.parse::<u64>().ok(),
            _ => {}
        }
    }
    let total = total_kb? as f64 * 1024.0;
    let available = available_kb? as f64 * 1024.0;
    if total <= 0.0 {
        return None;
    }
    Some(MemorySnapshot {
        used_percent: (1.0 - available / total) * 100.0,
        available_gb: available / BYTES_PER_GB,
    })
}

/// Probe returning whatever was last set. Used by tests and dry runs.
pub struct FixedMemory {
    used_percent: AtomicU64,
    available_gb: AtomicU64,
}

impl FixedMemory {
    pub fn new(used_percent: f64, available_gb: f64) -> Self {
        Self {
            used_percent: AtomicU64::new(used_percent.to_bits()),
            available_gb: AtomicU64::new(available_gb.to_bits()),
        }
    }

    pub fn set_used_percent(&self, used_percent: f64) {
        self.used_percent
            .store(used_percent.to_bits(), Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemory {
    fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            used_percent: f64::from_bits(self.used_percent.load(Ordering::SeqCst)),
            available_gb: f64::from_bits(self.available_gb.load(Ordering::SeqCst)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "MemTotal:       16777216 kB\n\
                          MemFree:         1048576 kB\n\
                          MemAvailable:    4194304 kB\n";

    #[test]
    fn test_parse_meminfo() {
        let snapshot = parse_meminfo(SAMPLE).unwrap();
        assert!((snapshot.used_percent - 75.0).abs() < 1e-9);
        assert!((snapshot.available_gb - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_meminfo_missing_fields() {
        assert!(parse_meminfo("MemTotal: 100 kB\n").is_none());
    }

    #[test]
    fn test_proc_meminfo_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let probe = ProcMemInfo::with_path(file.path());
        assert!((probe.snapshot().used_percent - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_unreadable_file_reports_zero() {
        let probe = ProcMemInfo::with_path("/nonexistent/meminfo");
        assert_eq!(probe.snapshot(), MemorySnapshot::default());
    }

    #[test]
    fn test_fixed_memory_can_be_updated() {
        let probe = FixedMemory::new(50.0, 8.0);
        probe.set_used_percent(97.0);
        assert_eq!(probe.snapshot().used_percent, 97.0);
        assert_eq!(probe.snapshot().available_gb, 8.0);
    }
}
