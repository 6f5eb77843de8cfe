use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use sysinfo::System;

const BYTES_PER_MB: u64 = 1_048_576;

/// Source of free-memory readings. Swappable so tests can fake pressure.
pub trait MemoryProbe: Send + Sync {
    fn available_mb(&self) -> Option<u64>;
}

/// Reads available RAM through sysinfo.
pub struct SystemMemory {
    sys: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self { sys: Mutex::new(System::new()) }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn available_mb(&self) -> Option<u64> {
        let mut sys = self.sys.lock().ok()?;
        sys.refresh_memory();
        Some(normalize_sysinfo_mem(sys.available_memory(), sys.total_memory()) / BYTES_PER_MB)
    }
}

/// Available memory in bytes. Some sysinfo releases report KiB instead of
/// bytes; compare the total against /proc/meminfo and scale when they agree in KiB.
fn normalize_sysinfo_mem(available_raw: u64, total_raw: u64) -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            if let Some(mem_total_kib) = meminfo
                .lines()
                .find(|l| l.starts_with("MemTotal:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|v| v.parse::<u64>().ok())
            {
                fn within_10_pct(a: f64, b: f64) -> bool {
                    (a - b).abs() / a.max(b) <= 0.1
                }
                if within_10_pct(total_raw as f64, mem_total_kib as f64) {
                    return available_raw.saturating_mul(1024);
                }
            }
        }
    }
    available_raw
}

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub max_in_flight: usize,
    /// 0 disables the memory check.
    pub memory_free_floor_mb: u64,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    Clear,
    Concurrency { in_flight: usize, limit: usize },
    Memory { available_mb: u64, floor_mb: u64 },
}

/// Advisory back-pressure checked between batch submissions.
pub struct ResourceThrottle {
    config: ThrottleConfig,
    probe: Box<dyn MemoryProbe>,
}

impl ResourceThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self::with_probe(config, Box::new(SystemMemory::new()))
    }

    pub fn with_probe(config: ThrottleConfig, probe: Box<dyn MemoryProbe>) -> Self {
        Self { config, probe }
    }

    pub fn check(&self, in_flight: usize) -> Pressure {
        if in_flight >= self.config.max_in_flight {
            return Pressure::Concurrency {
                in_flight,
                limit: self.config.max_in_flight,
            };
        }
        if self.config.memory_free_floor_mb > 0 {
            if let Some(available_mb) = self.probe.available_mb() {
                if available_mb < self.config.memory_free_floor_mb {
                    return Pressure::Memory {
                        available_mb,
                        floor_mb: self.config.memory_free_floor_mb,
                    };
                }
            }
        }
        Pressure::Clear
    }

    /// Sleep in fixed intervals until pressure clears or `abort` is raised.
    /// Returns the number of intervals slept.
    pub fn wait_for_capacity(&self, in_flight: &AtomicUsize, abort: &AtomicBool) -> u64 {
        let mut polls = 0;
        loop {
            if abort.load(Ordering::SeqCst) {
                return polls;
            }
            match self.check(in_flight.load(Ordering::SeqCst)) {
                Pressure::Clear => {
                    if polls > 0 {
                        tracing::info!(polls, "resource pressure cleared, resuming dispatch");
                    }
                    return polls;
                }
                pressure => {
                    if polls == 0 {
                        tracing::warn!(?pressure, "resource pressure, pausing dispatch");
                    }
                    thread::sleep(self.config.poll_interval);
                    polls += 1;
                }
            }
        }
    }
}
