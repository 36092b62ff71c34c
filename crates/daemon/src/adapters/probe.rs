//! Resource probe reading /proc
//!
//! CPU usage is computed from the delta between consecutive /proc/stat
//! samples, so the first snapshot after startup reports 0% CPU. Memory is
//! MemTotal - MemAvailable from /proc/meminfo, load is the 1-minute
//! average from /proc/loadavg.

use async_trait::async_trait;
use std::sync::Mutex;
use steward_core::error::{CoreError, CoreResult};
use steward_core::ports::{ResourceProbe, ResourceSnapshot};

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    busy: u64,
    total: u64,
}

#[derive(Default)]
pub struct ProcResourceProbe {
    last_cpu: Mutex<Option<CpuSample>>,
}

impl ProcResourceProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

fn parse_cpu_line(stat: &str) -> Option<CpuSample> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    Some(CpuSample {
        busy: total - idle,
        total,
    })
}

fn parse_meminfo_used_bytes(meminfo: &str) -> Option<u64> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total_kb = field("MemTotal:")?;
    let available_kb = field("MemAvailable:")?;
    Some(total_kb.saturating_sub(available_kb) * 1024)
}

fn parse_loadavg(loadavg: &str) -> Option<f64> {
    loadavg.split_whitespace().next()?.parse().ok()
}

#[async_trait]
impl ResourceProbe for ProcResourceProbe {
    async fn snapshot(&self) -> CoreResult<ResourceSnapshot> {
        let stat = tokio::fs::read_to_string("/proc/stat")
            .await
            .map_err(|e| CoreError::Transient(format!("read /proc/stat: {e}")))?;
        let meminfo = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .map_err(|e| CoreError::Transient(format!("read /proc/meminfo: {e}")))?;
        let loadavg = tokio::fs::read_to_string("/proc/loadavg")
            .await
            .map_err(|e| CoreError::Transient(format!("read /proc/loadavg: {e}")))?;

        let sample = parse_cpu_line(&stat)
            .ok_or_else(|| CoreError::Transient("unparseable /proc/stat".to_string()))?;
        let cpu_pct = {
            let mut last = self.last_cpu.lock().unwrap();
            let pct = match *last {
                Some(prev) if sample.total > prev.total => {
                    let busy = sample.busy.saturating_sub(prev.busy) as f64;
                    let total = (sample.total - prev.total) as f64;
                    (busy / total * 100.0).clamp(0.0, 100.0)
                }
                _ => 0.0,
            };
            *last = Some(sample);
            pct
        };

        Ok(ResourceSnapshot {
            cpu_pct,
            mem_bytes: parse_meminfo_used_bytes(&meminfo)
                .ok_or_else(|| CoreError::Transient("unparseable /proc/meminfo".to_string()))?,
            disk_bytes: 0,
            loadavg: parse_loadavg(&loadavg)
                .ok_or_else(|| CoreError::Transient("unparseable /proc/loadavg".to_string()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_line() {
        let stat = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4\n";
        let sample = parse_cpu_line(stat).unwrap();
        assert_eq!(sample.total, 1000);
        assert_eq!(sample.busy, 200);
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:        2000000 kB\nMemAvailable:   12000000 kB\n";
        assert_eq!(
            parse_meminfo_used_bytes(meminfo).unwrap(),
            4_000_000 * 1024
        );
    }

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(parse_loadavg("0.42 0.36 0.30 1/520 12345\n").unwrap(), 0.42);
    }

    #[tokio::test]
    async fn test_first_snapshot_reports_zero_cpu() {
        let probe = ProcResourceProbe::new();
        let snapshot = probe.snapshot().await.unwrap();
        assert_eq!(snapshot.cpu_pct, 0.0);
        assert!(snapshot.mem_bytes > 0);
    }
}
