use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};

use crate::JobId;
use crate::chain::ChainId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Submit,
    Escalate,
    Complete,
    FailAtMax,
    NotRetried,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Submit => "SUBMIT",
            Action::Escalate => "ESCALATE",
            Action::Complete => "COMPLETE",
            Action::FailAtMax => "FAIL_AT_MAX",
            Action::NotRetried => "NOT_RETRIED",
        };
        f.write_str(name)
    }
}

/// Append-only plain-text timeline of chain actions, one line per event,
/// ISO-8601 timestamp first. Observability only; decisions are never based
/// on this file, so write failures are logged and swallowed.
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: PathBuf) -> EventLog {
        EventLog { path }
    }

    pub fn record(
        &self,
        chain_id: &ChainId,
        action: Action,
        job_ids: &[JobId],
        level: Option<usize>,
        indices: Option<&str>,
    ) {
        if let Err(error) = self.append(chain_id, action, job_ids, level, indices) {
            log::warn!("Cannot write event log {}: {error}", self.path.display());
        }
    }

    fn append(
        &self,
        chain_id: &ChainId,
        action: Action,
        job_ids: &[JobId],
        level: Option<usize>,
        indices: Option<&str>,
    ) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;

        let jobs = if job_ids.is_empty() {
            "-".to_string()
        } else {
            job_ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        let level = level.map(|l| l.to_string()).unwrap_or_else(|| "-".to_string());
        writeln!(
            file,
            "{} {} {} job={} level={} indices={}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            chain_id,
            action,
            jobs,
            level,
            indices.unwrap_or("-"),
        )?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn events_append_one_line_each() {
        let dir = TempDir::new("events").unwrap();
        let log = EventLog::new(dir.path().join("history.log"));
        let chain: ChainId = "20260101-000000-aaaa".parse().unwrap();

        log.record(&chain, Action::Submit, &[100], Some(0), Some("0-9"));
        log.record(&chain, Action::Escalate, &[101, 102], Some(1), Some("1-3,7"));
        log.record(&chain, Action::Complete, &[], None, None);

        let content = std::fs::read_to_string(dir.path().join("history.log")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("SUBMIT job=100 level=0 indices=0-9"));
        assert!(lines[1].contains("ESCALATE job=101,102 level=1 indices=1-3,7"));
        assert!(lines[2].ends_with("COMPLETE job=- level=- indices=-"));
        // ISO-8601 timestamp leads every line.
        assert!(lines.iter().all(|l| l.chars().take(4).all(|c| c.is_ascii_digit())));
    }
}
