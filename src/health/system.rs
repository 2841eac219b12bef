//! Point-in-time process resource snapshot.
//!
//! # Responsibilities
//! - Read process memory from /proc/self/status
//! - Read host memory from /proc/meminfo
//! - Read Tokio runtime counters when inside a runtime
//!
//! # Design Decisions
//! - Never fails: unavailable values are reported as 0
//! - Not a pass/fail judgement; thresholds belong to callers

use serde::Serialize;
use std::time::{Duration, Instant, SystemTime};

/// Process memory, in bytes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    /// Resident set size (VmRSS).
    pub resident_bytes: u64,
    /// Peak resident set size (VmHWM).
    pub peak_resident_bytes: u64,
    /// Virtual memory size (VmSize).
    pub virtual_bytes: u64,
    /// Host physical memory (MemTotal).
    pub system_total_bytes: u64,
}

/// Scheduler counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeStats {
    /// OS threads in the process.
    pub os_threads: u64,
    /// Tokio worker threads, 0 outside a runtime.
    pub workers: usize,
    /// Tokio tasks currently alive, 0 outside a runtime.
    pub alive_tasks: usize,
}

/// Resource usage captured by [`capture`].
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealthSnapshot {
    pub uptime: Duration,
    pub memory: MemoryStats,
    pub runtime: RuntimeStats,
    pub captured_at: SystemTime,
}

/// Capture a snapshot. `started` is the process (or manager) start instant.
pub fn capture(started: Instant) -> SystemHealthSnapshot {
    let (memory, os_threads) = read_process_status();
    let (workers, alive_tasks) = runtime_counters();

    SystemHealthSnapshot {
        uptime: started.elapsed(),
        memory: MemoryStats {
            system_total_bytes: read_system_total(),
            ..memory
        },
        runtime: RuntimeStats {
            os_threads,
            workers,
            alive_tasks,
        },
        captured_at: SystemTime::now(),
    }
}

fn runtime_counters() -> (usize, usize) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let metrics = handle.metrics();
            (metrics.num_workers(), metrics.num_alive_tasks())
        }
        Err(_) => (0, 0),
    }
}

#[cfg(target_os = "linux")]
fn read_process_status() -> (MemoryStats, u64) {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return (MemoryStats::default(), 0);
    };
    parse_process_status(&status)
}

#[cfg(not(target_os = "linux"))]
fn read_process_status() -> (MemoryStats, u64) {
    (MemoryStats::default(), 0)
}

#[cfg(target_os = "linux")]
fn read_system_total() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| field_kb(&s, "MemTotal:"))
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn read_system_total() -> u64 {
    0
}

fn parse_process_status(status: &str) -> (MemoryStats, u64) {
    let memory = MemoryStats {
        resident_bytes: field_kb(status, "VmRSS:").unwrap_or(0),
        peak_resident_bytes: field_kb(status, "VmHWM:").unwrap_or(0),
        virtual_bytes: field_kb(status, "VmSize:").unwrap_or(0),
        system_total_bytes: 0,
    };
    let threads = field_value(status, "Threads:").unwrap_or(0);
    (memory, threads)
}

/// Value of a `Key:   1234 kB` line, in bytes.
fn field_kb(text: &str, key: &str) -> Option<u64> {
    field_value(text, key).map(|kb| kb * 1024)
}

fn field_value(text: &str, key: &str) -> Option<u64> {
    text.lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "Name:\tlifecycled\n\
        VmPeak:\t  200000 kB\n\
        VmSize:\t  180000 kB\n\
        VmHWM:\t    9000 kB\n\
        VmRSS:\t    8000 kB\n\
        Threads:\t7\n";

    #[test]
    fn test_parse_process_status() {
        let (memory, threads) = parse_process_status(STATUS);
        assert_eq!(memory.resident_bytes, 8000 * 1024);
        assert_eq!(memory.peak_resident_bytes, 9000 * 1024);
        assert_eq!(memory.virtual_bytes, 180000 * 1024);
        assert_eq!(threads, 7);
    }

    #[test]
    fn test_missing_fields_are_zero() {
        let (memory, threads) = parse_process_status("Name:\tx\n");
        assert_eq!(memory.resident_bytes, 0);
        assert_eq!(threads, 0);
    }

    #[tokio::test]
    async fn test_capture_inside_runtime() {
        let snapshot = capture(Instant::now());
        assert!(snapshot.runtime.workers >= 1);
    }
}
