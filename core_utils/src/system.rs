use eyre::{Context, Result};
use std::path::Path;
use sysinfo::{Pid, PidExt, ProcessExt, ProcessRefreshKind, System, SystemExt};
use tokio::fs;

/// Returns true if a process with the given pid is currently alive.
pub fn is_process_running(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_process_specifics(Pid::from_u32(pid), ProcessRefreshKind::new())
        .then(|| sys.process(Pid::from_u32(pid)).map(|proc| proc.status()))
        .flatten()
        .map_or(false, |status| status != sysinfo::ProcessStatus::Zombie)
}

/// Reads a `qemu.pid`-style file and returns the contained pid.
pub async fn read_pid_file(path: &Path) -> Result<u32> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read pid file {}", path.display()))?;
    content
        .trim()
        .parse()
        .with_context(|| format!("invalid pid file content in {}", path.display()))
}

/// Host-wide memory total/available in bytes, as reported by `/proc/meminfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Parses the subset of `/proc/meminfo` fields we care about.
pub fn parse_meminfo(content: &str) -> Result<MemInfo> {
    let mut total = None;
    let mut available = None;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next().unwrap_or_default();
        let value_kb: Option<u64> = parts.next().and_then(|v| v.parse().ok());
        match (key, value_kb) {
            ("MemTotal:", Some(v)) => total = Some(v * 1024),
            ("MemAvailable:", Some(v)) => available = Some(v * 1024),
            _ => {}
        }
    }
    Ok(MemInfo {
        total_bytes: total.unwrap_or_default(),
        available_bytes: available.unwrap_or_default(),
    })
}

pub async fn read_meminfo() -> Result<MemInfo> {
    let content = fs::read_to_string("/proc/meminfo")
        .await
        .context("failed to read /proc/meminfo")?;
    parse_meminfo(&content)
}

/// Parses the three load-average fields from `/proc/loadavg`.
pub fn parse_loadavg(content: &str) -> Result<(f64, f64, f64)> {
    let mut parts = content.split_whitespace();
    let one: f64 = parts
        .next()
        .context("missing 1-minute load average")?
        .parse()
        .context("invalid 1-minute load average")?;
    let five: f64 = parts
        .next()
        .context("missing 5-minute load average")?
        .parse()
        .context("invalid 5-minute load average")?;
    let fifteen: f64 = parts
        .next()
        .context("missing 15-minute load average")?
        .parse()
        .context("invalid 15-minute load average")?;
    Ok((one, five, fifteen))
}

pub async fn read_loadavg() -> Result<(f64, f64, f64)> {
    let content = fs::read_to_string("/proc/loadavg")
        .await
        .context("failed to read /proc/loadavg")?;
    parse_loadavg(&content)
}

/// Per-process CPU/memory accounting read from `/proc/<pid>/stat` and
/// `/proc/<pid>/statm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStats {
    pub utime_ticks: u64,
    pub stime_ticks: u64,
    pub resident_bytes: u64,
}

const PAGE_SIZE_BYTES: u64 = 4096;

/// Returns `(utime, stime)` in clock ticks. The comm field (2nd,
/// parenthesized) may itself contain spaces or closing parens, so fields
/// are counted from the last `)` rather than split from the start.
pub fn parse_proc_stat(content: &str) -> Result<(u64, u64)> {
    let after_comm = content
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .context("malformed /proc/<pid>/stat: no comm field")?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // Overall field numbering counts `pid` as 1 and `comm` as 2; state
    // (our fields[0]) is field 3, so utime (field 14) is fields[11] and
    // stime (field 15) is fields[12].
    let utime = fields
        .get(11)
        .context("missing utime field")?
        .parse()
        .context("invalid utime field")?;
    let stime = fields
        .get(12)
        .context("missing stime field")?
        .parse()
        .context("invalid stime field")?;
    Ok((utime, stime))
}

/// Returns resident set size in bytes from the second field of `/proc/<pid>/statm`.
pub fn parse_proc_statm(content: &str) -> Result<u64> {
    let resident_pages: u64 = content
        .split_whitespace()
        .nth(1)
        .context("missing resident field")?
        .parse()
        .context("invalid resident field")?;
    Ok(resident_pages * PAGE_SIZE_BYTES)
}

pub async fn read_process_stats(pid: u32) -> Result<ProcessStats> {
    let stat_content = fs::read_to_string(format!("/proc/{pid}/stat"))
        .await
        .with_context(|| format!("failed to read /proc/{pid}/stat"))?;
    let (utime_ticks, stime_ticks) = parse_proc_stat(&stat_content)?;

    let statm_content = fs::read_to_string(format!("/proc/{pid}/statm"))
        .await
        .with_context(|| format!("failed to read /proc/{pid}/statm"))?;
    let resident_bytes = parse_proc_statm(&statm_content)?;

    Ok(ProcessStats {
        utime_ticks,
        stime_ticks,
        resident_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16369876 kB\nMemFree:         1234 kB\nMemAvailable:    8192000 kB\n";
        let info = parse_meminfo(content).unwrap();
        assert_eq!(info.total_bytes, 16369876 * 1024);
        assert_eq!(info.available_bytes, 8192000 * 1024);
    }

    #[test]
    fn test_parse_loadavg() {
        let (one, five, fifteen) = parse_loadavg("0.52 0.58 0.59 2/931 12345\n").unwrap();
        assert_eq!(one, 0.52);
        assert_eq!(five, 0.58);
        assert_eq!(fifteen, 0.59);
    }

    #[test]
    fn test_parse_proc_stat() {
        let content = "1234 (qemu-system-x86_64) S 1 1234 1234 0 -1 4194304 1234 0 0 0 2500 600 0 0 20 0 4 0 9999 0 0 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0\n";
        let (utime, stime) = parse_proc_stat(content).unwrap();
        assert_eq!(utime, 2500);
        assert_eq!(stime, 600);
    }

    #[test]
    fn test_parse_proc_stat_comm_with_parens() {
        let content = "1234 (qemu (extra)) S 1 1234 1234 0 -1 4194304 1234 0 0 0 2500 600 0 0 20 0 4 0 9999 0 0 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0\n";
        let (utime, stime) = parse_proc_stat(content).unwrap();
        assert_eq!(utime, 2500);
        assert_eq!(stime, 600);
    }

    #[test]
    fn test_parse_proc_statm() {
        let resident_bytes = parse_proc_statm("25000 4096 2048 10 0 1000 0\n").unwrap();
        assert_eq!(resident_bytes, 4096 * 4096);
    }
}
