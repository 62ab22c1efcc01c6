use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Figures gathered for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub execution_time_ms: f64,
    /// Resident-memory growth over the execution, never negative
    pub memory_used_mb: f64,
    pub samples: u64,
}

#[derive(Debug)]
struct Entry {
    started: Instant,
    start_memory_mb: f64,
    samples: u64,
}

/// Per-execution bookkeeping of elapsed time, memory readings and samples.
///
/// Entries are keyed by execution id and must be stopped by the execution
/// that started them; [`MonitorGuard`] does that on every exit path. The
/// monitor only measures. Limits are enforced by the isolate.
#[derive(Debug, Default)]
pub struct ResourceMonitor {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start time and memory snapshot. Restarting an id resets it.
    pub fn start_monitoring(&self, execution_id: &str) {
        let entry = Entry {
            started: Instant::now(),
            start_memory_mb: Self::get_memory_usage(),
            samples: 0,
        };
        self.entries.lock().insert(execution_id.to_string(), entry);
    }

    /// Count one tracked interaction; returns the running count.
    pub fn record_sample(&self, execution_id: &str) -> Option<u64> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(execution_id)?;
        entry.samples += 1;
        Some(entry.samples)
    }

    /// Samples per second since the execution started.
    pub fn throughput(&self, execution_id: &str) -> Option<f64> {
        let entries = self.entries.lock();
        let entry = entries.get(execution_id)?;
        let elapsed = entry.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return Some(0.0);
        }
        Some(entry.samples as f64 / elapsed)
    }

    /// Close out an execution and purge its entry.
    pub fn stop_monitoring(&self, execution_id: &str) -> Option<Usage> {
        let entry = self.entries.lock().remove(execution_id)?;
        let end_memory_mb = Self::get_memory_usage();
        Some(Usage {
            execution_time_ms: entry.started.elapsed().as_secs_f64() * 1000.0,
            memory_used_mb: (end_memory_mb - entry.start_memory_mb).max(0.0),
            samples: entry.samples,
        })
    }

    pub fn is_monitoring(&self, execution_id: &str) -> bool {
        self.entries.lock().contains_key(execution_id)
    }

    /// Number of executions currently tracked.
    pub fn active(&self) -> usize {
        self.entries.lock().len()
    }

    /// Resident set size of this process in MB.
    ///
    /// Read from `/proc/self/statm` on Linux. Other platforms have no cheap
    /// introspection here and get `0.0`, which is a placeholder reading and
    /// says nothing about enforcement.
    #[cfg(target_os = "linux")]
    pub fn get_memory_usage() -> f64 {
        let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
            return 0.0;
        };
        let Some(resident_pages) = statm
            .split_whitespace()
            .nth(1)
            .and_then(|v| v.parse::<u64>().ok())
        else {
            return 0.0;
        };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return 0.0;
        }
        (resident_pages * page_size as u64) as f64 / BYTES_PER_MB
    }

    #[cfg(not(target_os = "linux"))]
    pub fn get_memory_usage() -> f64 {
        0.0
    }

    /// Peak resident set size of this process in KB, from `getrusage`.
    #[cfg(unix)]
    pub fn peak_memory_kb() -> Option<u64> {
        let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
        let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
        if rc != 0 {
            return None;
        }
        let usage = unsafe { usage.assume_init() };
        let max_rss = u64::try_from(usage.ru_maxrss).ok()?;
        // ru_maxrss is bytes on macOS, KB elsewhere
        if cfg!(target_os = "macos") {
            Some(max_rss / 1024)
        } else {
            Some(max_rss)
        }
    }

    #[cfg(not(unix))]
    pub fn peak_memory_kb() -> Option<u64> {
        None
    }
}

/// Stops monitoring when dropped, so no entry outlives its execution.
pub struct MonitorGuard {
    monitor: Arc<ResourceMonitor>,
    execution_id: String,
    finished: bool,
}

impl MonitorGuard {
    pub fn start(monitor: Arc<ResourceMonitor>, execution_id: &str) -> Self {
        monitor.start_monitoring(execution_id);
        Self {
            monitor,
            execution_id: execution_id.to_string(),
            finished: false,
        }
    }

    pub fn finish(mut self) -> Usage {
        self.finished = true;
        self.monitor
            .stop_monitoring(&self.execution_id)
            .unwrap_or_default()
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.monitor.stop_monitoring(&self.execution_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_purges_entry() {
        let monitor = ResourceMonitor::new();
        monitor.start_monitoring("exec-1");
        assert!(monitor.is_monitoring("exec-1"));

        std::thread::sleep(std::time::Duration::from_millis(5));
        let usage = monitor.stop_monitoring("exec-1").unwrap();
        assert!(usage.execution_time_ms >= 5.0);
        assert!(usage.memory_used_mb >= 0.0);
        assert!(!monitor.is_monitoring("exec-1"));
        assert!(monitor.stop_monitoring("exec-1").is_none());
    }

    #[test]
    fn test_samples_and_throughput() {
        let monitor = ResourceMonitor::new();
        assert_eq!(monitor.record_sample("missing"), None);

        monitor.start_monitoring("exec-2");
        assert_eq!(monitor.record_sample("exec-2"), Some(1));
        assert_eq!(monitor.record_sample("exec-2"), Some(2));
        assert!(monitor.throughput("exec-2").unwrap() >= 0.0);
        assert_eq!(monitor.stop_monitoring("exec-2").unwrap().samples, 2);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let monitor = Arc::new(ResourceMonitor::new());
        {
            let _guard = MonitorGuard::start(monitor.clone(), "exec-3");
            assert_eq!(monitor.active(), 1);
        }
        assert_eq!(monitor.active(), 0);

        let guard = MonitorGuard::start(monitor.clone(), "exec-4");
        let usage = guard.finish();
        assert!(usage.execution_time_ms >= 0.0);
        assert_eq!(monitor.active(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memory_reading_on_linux() {
        assert!(ResourceMonitor::get_memory_usage() > 0.0);
        assert!(ResourceMonitor::peak_memory_kb().unwrap() > 0);
    }
}
