use serde::Serialize;

use crate::error::{Error, Result};
use crate::runner::{CommandRunner, RunTarget, argv};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    pub dataset: String,
    pub name: String,
    pub creation_epoch: i64,
}

impl SnapshotRecord {
    pub fn full_name(&self) -> String {
        format!("{}@{}", self.dataset, self.name)
    }
}

/// Snapshots of `dataset` itself (not its children), newest first. A dataset
/// that does not exist lists as empty; any other failure is an error.
pub fn list(
    runner: &dyn CommandRunner,
    target: &RunTarget,
    zfs: &str,
    dataset: &str,
) -> Result<Vec<SnapshotRecord>> {
    let cmd = argv([
        zfs, "list", "-H", "-p", "-o", "name,creation", "-t", "snapshot", "-S", "creation",
        "-d", "1", dataset,
    ]);
    let out = runner.run(target, &cmd)?;
    if !out.success() {
        if is_missing_dataset(&out.stderr) {
            return Ok(Vec::new());
        }
        return Err(Error::msg(format!(
            "listing snapshots of {dataset} on {} failed: {}",
            target.describe(),
            out.summary()
        )));
    }
    parse_listing(dataset, &out.stdout)
}

fn is_missing_dataset(stderr: &str) -> bool {
    let m = stderr.to_ascii_lowercase();
    m.contains("does not exist") || m.contains("no such") || m.contains("not found")
}

pub fn parse_listing(dataset: &str, body: &str) -> Result<Vec<SnapshotRecord>> {
    let prefix = format!("{dataset}@");
    let mut out = Vec::new();
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut cols = line.split('\t');
        let (Some(full), Some(creation)) = (cols.next(), cols.next()) else {
            return Err(Error::msg(format!("unexpected snapshot listing line '{line}'")));
        };
        let Some(name) = full.strip_prefix(&prefix) else {
            continue;
        };
        let creation_epoch = creation.trim().parse::<i64>().map_err(|e| {
            Error::msg(format!("bad creation time '{creation}' for {full}: {e}"))
        })?;
        out.push(SnapshotRecord {
            dataset: dataset.to_string(),
            name: name.to_string(),
            creation_epoch,
        });
    }
    out.sort_by(|a, b| {
        b.creation_epoch
            .cmp(&a.creation_epoch)
            .then_with(|| b.name.cmp(&a.name))
    });
    Ok(out)
}
