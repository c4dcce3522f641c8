//! Key/value system property readers
//!
//! The CPU dispatcher speaks sysctl key names (`hw.ncpu`,
//! `machdep.cpu.brand_string`, ...). On macOS they are answered by the
//! kernel directly. Everywhere else [`SysinfoProperties`] maps the same key
//! names onto sysinfo, Linux sysfs and the Windows registry/WMI, so the
//! dispatcher runs unchanged on every platform.

use std::collections::HashMap;

/// Sysctl-style property source
pub trait SystemProperties: Send + Sync {
    /// Integer value of a named key
    fn int(&self, key: &str) -> Option<i64>;

    /// String value of a named key
    fn string(&self, key: &str) -> Option<String>;

    /// Integer value addressed by a numeric MIB
    fn int_mib(&self, _mib: &[i32]) -> Option<i64> {
        None
    }
}

pub const CTL_HW: i32 = 6;
pub const HW_CPU_FREQ: i32 = 15;

/// Real sysctl(3) reader
#[cfg(target_os = "macos")]
#[derive(Debug, Default, Clone, Copy)]
pub struct Sysctl;

#[cfg(target_os = "macos")]
impl Sysctl {
    fn raw(key: &str) -> Option<Vec<u8>> {
        let name = std::ffi::CString::new(key).ok()?;
        let mut size: libc::size_t = 0;
        // SAFETY: a null buffer asks the kernel for the value size only.
        let status = unsafe {
            libc::sysctlbyname(name.as_ptr(), std::ptr::null_mut(), &mut size, std::ptr::null_mut(), 0)
        };
        if status != 0 || size == 0 {
            return None;
        }
        let mut buffer = vec![0u8; size];
        // SAFETY: buffer holds `size` writable bytes.
        let status = unsafe {
            libc::sysctlbyname(
                name.as_ptr(),
                buffer.as_mut_ptr().cast(),
                &mut size,
                std::ptr::null_mut(),
                0,
            )
        };
        if status != 0 {
            return None;
        }
        buffer.truncate(size);
        Some(buffer)
    }
}

#[cfg(target_os = "macos")]
fn int_from_bytes(bytes: &[u8]) -> Option<i64> {
    match bytes.len() {
        4 => Some(i32::from_ne_bytes(bytes.try_into().ok()?) as i64),
        8 => Some(i64::from_ne_bytes(bytes.try_into().ok()?)),
        _ => None,
    }
}

#[cfg(target_os = "macos")]
impl SystemProperties for Sysctl {
    fn int(&self, key: &str) -> Option<i64> {
        int_from_bytes(&Self::raw(key)?)
    }

    fn string(&self, key: &str) -> Option<String> {
        let bytes = Self::raw(key)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        let value = String::from_utf8_lossy(&bytes[..end]).trim().to_string();
        (!value.is_empty()).then_some(value)
    }

    fn int_mib(&self, mib: &[i32]) -> Option<i64> {
        let mut mib = mib.to_vec();
        let mut value: libc::c_uint = 0;
        let mut size = std::mem::size_of::<libc::c_uint>();
        // SAFETY: value is a properly sized output buffer for the request.
        let status = unsafe {
            libc::sysctl(
                mib.as_mut_ptr(),
                mib.len() as libc::c_uint,
                (&mut value as *mut libc::c_uint).cast(),
                &mut size,
                std::ptr::null_mut(),
                0,
            )
        };
        (status == 0).then_some(value as i64)
    }
}

/// Sysctl key names answered from sysinfo and OS-specific files.
///
/// All values are captured once at construction; lookups never touch the OS.
#[derive(Debug, Default, Clone)]
pub struct SysinfoProperties {
    ints: HashMap<String, i64>,
    strings: HashMap<String, String>,
}

impl SysinfoProperties {
    pub fn collect() -> Self {
        use sysinfo::System;

        let mut props = SysinfoProperties::default();
        let mut sys = System::new();
        sys.refresh_cpu_all();

        if let Some(cpu) = sys.cpus().first() {
            props.set_string("machdep.cpu.brand_string", cpu.brand());
            props.set_string("machdep.cpu.vendor", cpu.vendor_id());
            // On Linux this is the current clock, not the nominal one
            #[cfg(not(target_os = "linux"))]
            if cpu.frequency() > 0 {
                props.set_int("hw.cpufrequency", cpu.frequency() as i64 * 1_000_000);
            }
        }
        if !sys.cpus().is_empty() {
            props.set_int("hw.ncpu", sys.cpus().len() as i64);
        }
        if let Some(physical) = sys.physical_core_count() {
            props.set_int("hw.physicalcpu", physical as i64);
        }

        #[cfg(target_os = "linux")]
        props.collect_linux(std::path::Path::new("/sys/devices/system/cpu"));

        #[cfg(target_os = "windows")]
        props.collect_windows();

        props
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.ints.insert(key.to_string(), value);
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        let value = value.trim();
        if !value.is_empty() {
            self.strings.insert(key.to_string(), value.to_string());
        }
    }

    /// Core counts, frequency range and performance levels from
    /// `/sys/devices/system/cpu`
    #[cfg(target_os = "linux")]
    fn collect_linux(&mut self, cpu_root: &std::path::Path) {
        use std::fs;

        let read = |name: &str| fs::read_to_string(cpu_root.join(name)).ok();

        if let Some(present) = read("present").as_deref().and_then(count_cpu_list) {
            self.set_int("hw.logicalcpu_max", present as i64);
        }
        if let Some(online) = read("online").as_deref().and_then(count_cpu_list) {
            self.set_int("hw.logicalcpu", online as i64);
        }

        // Group CPUs by their hardware maximum clock: one group per performance level
        let mut max_freqs_khz = Vec::new();
        let mut min_freq_khz: Option<u64> = None;
        if let Ok(entries) = fs::read_dir(cpu_root) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let is_cpu = name
                    .strip_prefix("cpu")
                    .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
                if !is_cpu {
                    continue;
                }
                let cpufreq = entry.path().join("cpufreq");
                if let Some(max) = read_khz(&cpufreq.join("cpuinfo_max_freq")) {
                    max_freqs_khz.push(max);
                }
                if let Some(min) = read_khz(&cpufreq.join("cpuinfo_min_freq")) {
                    min_freq_khz = Some(min_freq_khz.map_or(min, |m| m.min(min)));
                }
            }
        }

        // Nominal clock; only intel_pstate and amd-pstate publish it
        if let Some(base) = read_khz(&cpu_root.join("cpu0/cpufreq/base_frequency")) {
            self.set_int("hw.cpufrequency", base as i64 * 1000);
        }

        if let Some(&max) = max_freqs_khz.iter().max() {
            self.set_int("hw.cpufrequency_max", max as i64 * 1000);
        }
        if let Some(min) = min_freq_khz {
            self.set_int("hw.cpufrequency_min", min as i64 * 1000);
        }

        let levels = performance_levels(&max_freqs_khz);
        for (level, count) in levels.iter().enumerate() {
            self.set_int(&format!("hw.perflevel{level}.logicalcpu"), *count as i64);
        }
        if !levels.is_empty() {
            self.set_int("hw.nperflevels", levels.len() as i64);
        }
    }

    /// Base and max clock from the registry and WMI
    #[cfg(target_os = "windows")]
    fn collect_windows(&mut self) {
        use std::process::Command;

        // Registry: "    ~MHz    REG_DWORD    0x1e61"
        if let Ok(output) = Command::new("reg")
            .args([
                "query",
                "HKEY_LOCAL_MACHINE\\HARDWARE\\DESCRIPTION\\System\\CentralProcessor\\0",
                "/v",
                "~MHz",
            ])
            .output()
        {
            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if let Some(mhz) = parse_reg_dword(&stdout, "~MHz") {
                    self.set_int("hw.cpufrequency", mhz as i64 * 1_000_000);
                }
            }
        }

        if let Ok(output) = Command::new("wmic")
            .args(["cpu", "get", "MaxClockSpeed", "/format:csv"])
            .output()
        {
            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                for line in stdout.lines().skip(1) {
                    let parts: Vec<&str> = line.split(',').collect();
                    if let Some(Ok(mhz)) = parts.get(1).map(|p| p.trim().parse::<i64>()) {
                        self.set_int("hw.cpufrequency_max", mhz * 1_000_000);
                        break;
                    }
                }
            }
        }
    }
}

impl SystemProperties for SysinfoProperties {
    fn int(&self, key: &str) -> Option<i64> {
        self.ints.get(key).copied()
    }

    fn string(&self, key: &str) -> Option<String> {
        self.strings.get(key).cloned()
    }
}

/// Count CPUs in a kernel cpu list such as `0-3,8,10-11`
pub fn count_cpu_list(list: &str) -> Option<usize> {
    let list = list.trim();
    if list.is_empty() {
        return None;
    }
    let mut count = 0;
    for range in list.split(',') {
        match range.split_once('-') {
            Some((start, end)) => {
                let start: usize = start.trim().parse().ok()?;
                let end: usize = end.trim().parse().ok()?;
                if end < start {
                    return None;
                }
                count += end - start + 1;
            }
            None => {
                range.trim().parse::<usize>().ok()?;
                count += 1;
            }
        }
    }
    Some(count)
}

/// Logical CPU counts per distinct max frequency, fastest level first
pub fn performance_levels(max_freqs: &[u64]) -> Vec<usize> {
    let mut levels: Vec<(u64, usize)> = Vec::new();
    for &freq in max_freqs {
        match levels.iter_mut().find(|(f, _)| *f == freq) {
            Some((_, count)) => *count += 1,
            None => levels.push((freq, 1)),
        }
    }
    levels.sort_by(|a, b| b.0.cmp(&a.0));
    levels.into_iter().map(|(_, count)| count).collect()
}

#[cfg(target_os = "linux")]
fn read_khz(path: &std::path::Path) -> Option<u64> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|&khz| khz > 0)
}

#[cfg(any(target_os = "windows", test))]
fn parse_reg_dword(output: &str, value_name: &str) -> Option<u64> {
    output
        .lines()
        .filter(|line| line.contains(value_name))
        .filter_map(|line| line.split_whitespace().last())
        .find_map(|hex| u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok())
}

/// The platform's native property source
pub fn system_properties() -> Box<dyn SystemProperties> {
    #[cfg(target_os = "macos")]
    {
        Box::new(Sysctl)
    }
    #[cfg(not(target_os = "macos"))]
    {
        Box::new(SysinfoProperties::collect())
    }
}
