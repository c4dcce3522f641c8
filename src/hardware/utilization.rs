//! CPU utilization by differential sampling
//!
//! Two snapshots of the per-processor cumulative time-in-state counters are
//! taken `interval` apart and the busy share of the elapsed ticks is
//! reported. The sleep between the snapshots blocks the calling thread; run
//! detection on a blocking task when that matters (see
//! [`crate::report::collect_async`]).

use std::time::Duration;

use crate::error::ProbeError;

/// Cumulative ticks spent in each state by one processor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTicks {
    pub user: u64,
    pub system: u64,
    pub nice: u64,
    pub idle: u64,
}

impl CpuTicks {
    pub fn busy(&self) -> u64 {
        self.user + self.system + self.nice
    }
}

/// Source of per-processor tick counters
pub trait ProcessorLoad: Send + Sync {
    fn snapshot(&self) -> Result<Vec<CpuTicks>, ProbeError>;
}

/// Take two snapshots `interval` apart and compute the combined busy rate.
///
/// Returns `None` when either snapshot fails, the processor count changes
/// between them, or no ticks elapsed at all.
pub fn sample_utilization(load: &dyn ProcessorLoad, interval: Duration) -> Option<f64> {
    let before = match load.snapshot() {
        Ok(ticks) => ticks,
        Err(err) => {
            tracing::debug!(error = %err, "processor load snapshot failed");
            return None;
        }
    };

    std::thread::sleep(interval);

    let after = match load.snapshot() {
        Ok(ticks) => ticks,
        Err(err) => {
            tracing::debug!(error = %err, "processor load snapshot failed");
            return None;
        }
    };

    utilization_between(&before, &after)
}

/// Busy percentage across all processors between two snapshots
pub fn utilization_between(before: &[CpuTicks], after: &[CpuTicks]) -> Option<f64> {
    if before.is_empty() || before.len() != after.len() {
        return None;
    }

    let mut busy: u64 = 0;
    let mut total: u64 = 0;
    for (prev, next) in before.iter().zip(after) {
        let in_use = next.busy().saturating_sub(prev.busy());
        let idle = next.idle.saturating_sub(prev.idle);
        busy += in_use;
        total += in_use + idle;
    }

    // No elapsed ticks: the rate is undefined, report it as unset
    if total == 0 {
        return None;
    }

    Some((busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
}

/// `/proc/stat` per-CPU lines
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct ProcStat {
    path: std::path::PathBuf,
}

#[cfg(target_os = "linux")]
impl Default for ProcStat {
    fn default() -> Self {
        Self {
            path: std::path::PathBuf::from("/proc/stat"),
        }
    }
}

#[cfg(target_os = "linux")]
impl ProcessorLoad for ProcStat {
    fn snapshot(&self) -> Result<Vec<CpuTicks>, ProbeError> {
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| ProbeError::io(&self.path, e))?;
        let ticks = parse_proc_stat(&content);
        if ticks.is_empty() {
            return Err(ProbeError::unavailable("no per-cpu lines in /proc/stat"));
        }
        Ok(ticks)
    }
}

/// Parse `cpuN user nice system idle iowait irq softirq steal ...` lines.
///
/// The aggregate `cpu` line is skipped. Interrupt and steal time count as
/// system time, iowait counts as idle.
#[cfg(any(target_os = "linux", test))]
pub fn parse_proc_stat(content: &str) -> Vec<CpuTicks> {
    content
        .lines()
        .filter(|line| {
            line.strip_prefix("cpu")
                .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        })
        .filter_map(|line| {
            let fields: Vec<u64> = line
                .split_whitespace()
                .skip(1)
                .map(|v| v.parse::<u64>())
                .collect::<Result<_, _>>()
                .ok()?;
            let field = |i: usize| fields.get(i).copied().unwrap_or(0);
            if fields.len() < 4 {
                return None;
            }
            Some(CpuTicks {
                user: field(0),
                nice: field(1),
                system: field(2) + field(5) + field(6) + field(7),
                idle: field(3) + field(4),
            })
        })
        .collect()
}

/// Mach `host_processor_info(PROCESSOR_CPU_LOAD_INFO)`
#[cfg(target_os = "macos")]
#[derive(Debug, Default, Clone, Copy)]
pub struct MachHostLoad;

#[cfg(target_os = "macos")]
mod mach {
    pub const PROCESSOR_CPU_LOAD_INFO: i32 = 2;
    pub const CPU_STATE_USER: usize = 0;
    pub const CPU_STATE_SYSTEM: usize = 1;
    pub const CPU_STATE_IDLE: usize = 2;
    pub const CPU_STATE_NICE: usize = 3;
    pub const CPU_STATE_MAX: usize = 4;

    extern "C" {
        pub static mach_task_self_: u32;
        pub fn mach_host_self() -> u32;
        pub fn host_processor_info(
            host: u32,
            flavor: i32,
            out_processor_count: *mut u32,
            out_processor_info: *mut *mut i32,
            out_processor_info_count: *mut u32,
        ) -> i32;
        pub fn vm_deallocate(target_task: u32, address: usize, size: usize) -> i32;
    }
}

#[cfg(target_os = "macos")]
impl ProcessorLoad for MachHostLoad {
    fn snapshot(&self) -> Result<Vec<CpuTicks>, ProbeError> {
        use mach::*;

        let mut cpu_count: u32 = 0;
        let mut info: *mut i32 = std::ptr::null_mut();
        let mut info_count: u32 = 0;
        // SAFETY: all out-pointers are valid; the kernel allocates `info`.
        let code = unsafe {
            host_processor_info(
                mach_host_self(),
                PROCESSOR_CPU_LOAD_INFO,
                &mut cpu_count,
                &mut info,
                &mut info_count,
            )
        };
        if code != 0 || info.is_null() {
            return Err(ProbeError::Call {
                call: "host_processor_info",
                code: code as u32,
            });
        }

        // SAFETY: the kernel returned `info_count` integers at `info`.
        let states = unsafe { std::slice::from_raw_parts(info, info_count as usize) };
        let ticks = states
            .chunks_exact(CPU_STATE_MAX)
            .take(cpu_count as usize)
            .map(|cpu| CpuTicks {
                user: cpu[CPU_STATE_USER] as u32 as u64,
                system: cpu[CPU_STATE_SYSTEM] as u32 as u64,
                nice: cpu[CPU_STATE_NICE] as u32 as u64,
                idle: cpu[CPU_STATE_IDLE] as u32 as u64,
            })
            .collect();

        // SAFETY: releases the array allocated by host_processor_info.
        unsafe {
            vm_deallocate(
                mach_task_self_,
                info as usize,
                info_count as usize * std::mem::size_of::<i32>(),
            );
        }

        Ok(ticks)
    }
}

/// `GetSystemTimes`: one aggregate entry for all processors
#[cfg(target_os = "windows")]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimes;

#[cfg(target_os = "windows")]
impl ProcessorLoad for SystemTimes {
    fn snapshot(&self) -> Result<Vec<CpuTicks>, ProbeError> {
        use windows_sys::Win32::Foundation::{GetLastError, FILETIME};
        use windows_sys::Win32::System::Threading::GetSystemTimes;

        let zero = FILETIME {
            dwLowDateTime: 0,
            dwHighDateTime: 0,
        };
        let (mut idle, mut kernel, mut user) = (zero, zero, zero);
        // SAFETY: all three out-pointers are valid FILETIME structs.
        let ok = unsafe { GetSystemTimes(&mut idle, &mut kernel, &mut user) };
        if ok == 0 {
            return Err(ProbeError::Call {
                call: "GetSystemTimes",
                // SAFETY: reads the calling thread's last-error value.
                code: unsafe { GetLastError() },
            });
        }

        let as_u64 = |ft: FILETIME| ((ft.dwHighDateTime as u64) << 32) | ft.dwLowDateTime as u64;
        let idle = as_u64(idle);
        // Kernel time includes idle time
        Ok(vec![CpuTicks {
            user: as_u64(user),
            system: as_u64(kernel).saturating_sub(idle),
            nice: 0,
            idle,
        }])
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedLoad;

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
impl ProcessorLoad for UnsupportedLoad {
    fn snapshot(&self) -> Result<Vec<CpuTicks>, ProbeError> {
        Err(ProbeError::Unsupported("processor tick counters".to_string()))
    }
}

/// The platform's tick counter source
pub fn processor_load() -> Box<dyn ProcessorLoad> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcStat::default())
    }
    #[cfg(target_os = "macos")]
    {
        Box::new(MachHostLoad)
    }
    #[cfg(target_os = "windows")]
    {
        Box::new(SystemTimes)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Box::new(UnsupportedLoad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn ticks(user: u64, system: u64, nice: u64, idle: u64) -> CpuTicks {
        CpuTicks {
            user,
            system,
            nice,
            idle,
        }
    }

    /// Replays a fixed sequence of snapshots
    struct Replay(Mutex<Vec<Result<Vec<CpuTicks>, ()>>>);

    impl ProcessorLoad for Replay {
        fn snapshot(&self) -> Result<Vec<CpuTicks>, ProbeError> {
            self.0
                .lock()
                .unwrap()
                .remove(0)
                .map_err(|_| ProbeError::unavailable("replay failure"))
        }
    }

    #[test]
    fn combines_all_processors() {
        let before = [ticks(100, 50, 0, 850), ticks(0, 0, 0, 1000)];
        let after = [ticks(150, 100, 0, 850), ticks(0, 0, 0, 1100)];
        // busy 100 of 200 elapsed ticks
        assert_eq!(utilization_between(&before, &after), Some(50.0));
    }

    #[test]
    fn nice_time_counts_as_busy() {
        let before = [ticks(0, 0, 0, 0)];
        let after = [ticks(10, 10, 20, 60)];
        assert_eq!(utilization_between(&before, &after), Some(40.0));
    }

    #[test]
    fn zero_elapsed_ticks_is_unset() {
        let snapshot = [ticks(5, 5, 5, 5)];
        assert_eq!(utilization_between(&snapshot, &snapshot), None);
    }

    #[test]
    fn mismatched_processor_counts_are_unset() {
        let before = [ticks(0, 0, 0, 0)];
        let after = [ticks(1, 0, 0, 1), ticks(1, 0, 0, 1)];
        assert_eq!(utilization_between(&before, &after), None);
        assert_eq!(utilization_between(&[], &[]), None);
    }

    #[test]
    fn counter_going_backwards_stays_in_range() {
        let before = [ticks(500, 0, 0, 100)];
        let after = [ticks(100, 0, 0, 200)];
        let rate = utilization_between(&before, &after).unwrap();
        assert!((0.0..=100.0).contains(&rate));
    }

    #[test]
    fn sample_uses_both_snapshots() {
        let load = Replay(Mutex::new(vec![
            Ok(vec![ticks(0, 0, 0, 0)]),
            Ok(vec![ticks(30, 0, 0, 70)]),
        ]));
        let rate = sample_utilization(&load, Duration::ZERO);
        assert_eq!(rate, Some(30.0));
    }

    #[test]
    fn failed_snapshot_is_unset() {
        let load = Replay(Mutex::new(vec![Ok(vec![ticks(0, 0, 0, 0)]), Err(())]));
        assert_eq!(sample_utilization(&load, Duration::ZERO), None);
    }

    #[test]
    fn proc_stat_skips_aggregate_line() {
        let content = "cpu  10 20 30 40 50 6 7 8 0 0\n\
                       cpu0 1 2 3 4 5 6 7 8 0 0\n\
                       cpu1 10 0 10 80\n\
                       intr 12345\n";
        let parsed = parse_proc_stat(content);
        assert_eq!(
            parsed,
            vec![ticks(1, 3 + 6 + 7 + 8, 2, 4 + 5), ticks(10, 10, 0, 80)]
        );
    }
}
