use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, mpsc};

use chrono::{DateTime, Local, TimeZone};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// Operator-relevant: skips, transfer failures, deletions, space deltas.
    Notice { job: Option<usize>, message: String },
    Info { job: Option<usize>, message: String },
    /// Sanitized output line of a child process.
    Output { job: usize, line: String },
    JobFinished { job: usize, state: String },
}

impl RunEvent {
    pub fn notice(job: usize, message: impl Into<String>) -> Self {
        Self::Notice {
            job: Some(job),
            message: message.into(),
        }
    }

    pub fn info(job: usize, message: impl Into<String>) -> Self {
        Self::Info {
            job: Some(job),
            message: message.into(),
        }
    }

    /// Not tied to a job: run start, summary, report delivery.
    pub fn run_info(message: impl Into<String>) -> Self {
        Self::Info {
            job: None,
            message: message.into(),
        }
    }

    pub fn run_notice(message: impl Into<String>) -> Self {
        Self::Notice {
            job: None,
            message: message.into(),
        }
    }

    pub fn is_notice(&self) -> bool {
        matches!(self, Self::Notice { .. })
    }

    pub fn render(&self) -> String {
        fn scope(job: &Option<usize>) -> String {
            job.map(|j| format!("[job {j}] ")).unwrap_or_default()
        }
        match self {
            Self::Notice { job, message } => format!("{}notice: {message}", scope(job)),
            Self::Info { job, message } => format!("{}{message}", scope(job)),
            Self::Output { job, line } => format!("[job {job}] | {line}"),
            Self::JobFinished { job, state } => format!("[job {job}] finished: {state}"),
        }
    }
}

pub trait EventSink {
    fn emit(&self, ev: RunEvent);
}

/// `<program>_<timestamp>`, also the session log file stem and mail subject.
pub fn run_id<Tz: TimeZone>(program: &str, at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{program}_{}", at.format("%Y-%m-%d_%H.%M.%S"))
}

/// Append-only session log with an optional syslog mirror for notices.
pub struct SessionLog {
    path: PathBuf,
    file: Mutex<File>,
    syslog_tag: Option<String>,
}

impl SessionLog {
    pub fn open(log_dir: &Path, run_id: &str) -> Result<Self> {
        fs::create_dir_all(log_dir).map_err(|e| {
            Error::msg(format!("cannot create log dir {}: {e}", log_dir.display()))
        })?;
        let path = log_dir.join(format!("{run_id}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::msg(format!("cannot open session log {}: {e}", path.display())))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            syslog_tag: None,
        })
    }

    pub fn with_syslog(mut self, tag: impl Into<String>) -> Self {
        self.syslog_tag = Some(tag.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contents(&self) -> Result<String> {
        if let Ok(mut f) = self.file.lock() {
            let _ = f.flush();
        }
        fs::read_to_string(&self.path)
            .map_err(|e| Error::msg(format!("cannot read {}: {e}", self.path.display())))
    }

    fn write_line(&self, line: &str) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Ok(mut f) = self.file.lock() {
            if let Err(e) = writeln!(f, "{stamp} {line}") {
                tracing::warn!(path = %self.path.display(), error = %e, "session log write failed");
            }
        }
    }

    fn syslog(&self, tag: &str, line: &str) {
        let tag = format!("{tag}[{}]", std::process::id());
        let res = Command::new("logger")
            .args(["-t", &tag, "-p", "user.notice", "--", line])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match res {
            Ok(s) if s.success() => {}
            Ok(s) => tracing::debug!(status = %s, "logger exited non-zero"),
            Err(e) => tracing::debug!(error = %e, "logger unavailable"),
        }
    }
}

impl EventSink for SessionLog {
    fn emit(&self, ev: RunEvent) {
        let line = ev.render();
        self.write_line(&line);
        match &ev {
            RunEvent::Notice { job, message } => {
                tracing::info!(job = ?job, "{message}");
                if let Some(tag) = &self.syslog_tag {
                    self.syslog(tag, &line);
                }
            }
            RunEvent::Info { job, message } => tracing::debug!(job = ?job, "{message}"),
            RunEvent::Output { job, line } => tracing::trace!(job, "{line}"),
            RunEvent::JobFinished { job, state } => tracing::info!(job, state = %state, "job finished"),
        }
    }
}

/// Forwards events to a receiver; handy for driving a UI or asserting in tests.
pub struct ChannelSink {
    tx: Mutex<mpsc::Sender<RunEvent>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<RunEvent>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, ev: RunEvent) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(ev);
        }
    }
}

#[derive(Default)]
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&self, ev: RunEvent) {
        println!("{}", ev.render());
    }
}

/// Sends events to process logging only, keeping stdout free for JSON output.
#[derive(Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, ev: RunEvent) {
        if ev.is_notice() {
            tracing::warn!("{}", ev.render());
        } else {
            tracing::info!("{}", ev.render());
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn run_id_is_program_and_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single().expect("time");
        assert_eq!(run_id("snaprep", &at), "snaprep_2024-01-02_03.04.05");
    }

    #[test]
    fn session_log_appends_rendered_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = SessionLog::open(&dir.path().join("logs"), "snaprep_x").expect("open");
        log.emit(RunEvent::notice(2, "source tank/gone does not exist"));
        log.emit(RunEvent::Output {
            job: 1,
            line: "full send of tank/data@s1".into(),
        });
        let body = log.contents().expect("read");
        assert!(body.contains("[job 2] notice: source tank/gone does not exist"));
        assert!(body.contains("[job 1] | full send of tank/data@s1"));
        assert!(log.path().ends_with("snaprep_x.log"));
    }
}
