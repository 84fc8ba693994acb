//! Small process-level helpers.

/// Resident set size of this process in bytes. Only implemented for Linux
/// (`VmRSS` from `/proc/self/status`, reported in kB); other platforms
/// report zero, which disables the supervisor's memory policing rather than
/// tripping it.
#[cfg(target_os = "linux")]
pub fn resident_memory_bytes() -> u64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0;
    };
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.trim().split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
pub fn resident_memory_bytes() -> u64 {
    0
}

pub fn resident_memory_mb() -> u64 {
    resident_memory_bytes() / (1024 * 1024)
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn resident_memory_is_nonzero_on_linux() {
        assert!(resident_memory_bytes() > 0);
    }

    #[test]
    fn now_millis_is_recent() {
        // 2020-01-01 in milliseconds; a sanity floor, not an exact check.
        assert!(now_millis() > 1_577_836_800_000);
    }
}
