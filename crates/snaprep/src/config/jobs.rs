use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};

/// One line of the job list: `<source> <destination> <retention-days> <Y|N>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationJob {
    pub ordinal: usize,
    pub source_dataset: String,
    pub destination_specifier: String,
    pub retention_days: u32,
    pub enabled: bool,
}

impl ReplicationJob {
    pub fn retention_secs(&self) -> i64 {
        i64::from(self.retention_days) * 86_400
    }
}

fn valid_dataset_path(s: &str) -> bool {
    !s.is_empty() && !s.contains('@') && !s.starts_with('/') && !s.ends_with('/')
}

/// Parse a whole job list. Blank lines and `#` comments are ignored; any other
/// malformed line rejects the whole list, since a misread retention period
/// would delete snapshots the operator meant to keep.
pub fn parse_jobs(text: &str) -> Result<Vec<ReplicationJob>> {
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let lineno = idx + 1;
        let fields: Vec<&str> = line.split_whitespace().collect();
        let &[source, destination, retention, enabled] = fields.as_slice() else {
            return Err(Error::msg(format!(
                "job list line {lineno}: expected 4 fields (source destination retention-days enabled), got {}",
                fields.len()
            )));
        };
        if !valid_dataset_path(source) {
            return Err(Error::msg(format!(
                "job list line {lineno}: invalid source dataset '{source}'"
            )));
        }
        let retention_days = retention.parse::<u32>().map_err(|e| {
            Error::msg(format!(
                "job list line {lineno}: invalid retention '{retention}': {e}"
            ))
        })?;
        out.push(ReplicationJob {
            ordinal: out.len() + 1,
            source_dataset: source.to_string(),
            destination_specifier: destination.to_string(),
            retention_days,
            enabled: enabled == "Y",
        });
    }
    Ok(out)
}

pub fn load_jobs(path: &Path) -> Result<Vec<ReplicationJob>> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read job list {}: {e}", path.display())))?;
    parse_jobs(&text)
}
