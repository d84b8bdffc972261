//! Status command implementation.

use anyhow::Result;
use chrono::NaiveDateTime;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::config::Config;
use crate::enforcer::{IptablesFilter, PacketFilter};
use crate::schedule::{Clock, ScheduleWindow, SystemClock};
use crate::targets::TargetRegistry;

/// Snapshot of what the daemon would enforce and what the filter holds.
#[derive(Debug)]
pub struct StatusReport {
    pub targets: Result<Vec<Ipv4Addr>, String>,
    pub window: ScheduleWindow,
    pub in_window: bool,
    pub blocked: Result<Vec<Ipv4Addr>, String>,
}

impl StatusReport {
    pub async fn collect(
        config: &Config,
        filter: &dyn PacketFilter,
        now: NaiveDateTime,
    ) -> Result<Self> {
        let window = config.schedule.window()?;
        let targets = TargetRegistry::load(&config.targets_file)
            .map(|r| r.snapshot())
            .map_err(|e| format!("{:#}", e));
        let blocked = filter.blocked().await.map_err(|e| format!("{:#}", e));

        Ok(Self {
            targets,
            window,
            in_window: window.contains(now.time()),
            blocked,
        })
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, label: &str, list: &Result<Vec<Ipv4Addr>, String>) -> fmt::Result {
    match list {
        Ok(addrs) if addrs.is_empty() => writeln!(f, "{}: none", label),
        Ok(addrs) => {
            writeln!(f, "{}: {}", label, addrs.len())?;
            for addr in addrs {
                writeln!(f, "  - {}", addr)?;
            }
            Ok(())
        }
        Err(e) => writeln!(f, "{}: unavailable ({})", label, e),
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Schedule window: {} ({})",
            self.window,
            if self.in_window { "active now" } else { "inactive now" }
        )?;
        write_list(f, "Targets", &self.targets)?;
        write_list(f, "Blocked", &self.blocked)
    }
}

/// Run the status command
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let filter = IptablesFilter::from_config(&config.filter);
    let report = StatusReport::collect(&config, &filter, SystemClock.now()).await?;

    println!();
    print!("{}", report);
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcer::mock::MemoryFilter;
    use chrono::NaiveDate;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn at(hh: u32, mm: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(hh, mm, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_report() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "10.0.0.5\n10.0.0.6").unwrap();
        let config = Config {
            targets_file: file.path().to_path_buf(),
            ..Config::default()
        };

        let filter = MemoryFilter::new();
        filter.ensure_blocked(Ipv4Addr::new(10, 0, 0, 6)).await.unwrap();

        let report = StatusReport::collect(&config, &filter, at(1, 30)).await.unwrap();
        assert!(report.in_window);
        assert_eq!(report.targets.as_ref().unwrap().len(), 2);
        assert_eq!(report.blocked.as_ref().unwrap(), &vec![Ipv4Addr::new(10, 0, 0, 6)]);

        let text = report.to_string();
        assert!(text.contains("00:00-06:00 (active now)"));
        assert!(text.contains("Targets: 2"));
        assert!(text.contains("  - 10.0.0.6"));
    }

    #[tokio::test]
    async fn test_status_survives_missing_targets() {
        let config = Config {
            targets_file: "/nonexistent/targets.txt".into(),
            ..Config::default()
        };
        let filter = MemoryFilter::new();
        let report = StatusReport::collect(&config, &filter, at(12, 0)).await.unwrap();
        assert!(!report.in_window);
        assert!(report.targets.is_err());
        assert!(report.to_string().contains("Targets: unavailable"));
        assert!(report.to_string().contains("Blocked: none"));
    }
}
