use serde::Serialize;

use crate::inventory::SnapshotRecord;
use crate::runner::{CommandRunner, RunTarget, argv};
use crate::transfer::JobOutcome;

/// Pre-existing snapshots whose age reached the retention period. `keep` (the
/// snapshot taken this run) is never selected.
pub fn expired<'a>(
    snapshots: &'a [SnapshotRecord],
    now_epoch: i64,
    retention_secs: i64,
    keep: &str,
) -> Vec<&'a SnapshotRecord> {
    snapshots
        .iter()
        .filter(|s| s.name != keep)
        .filter(|s| now_epoch.saturating_sub(s.creation_epoch) >= retention_secs)
        .collect()
}

pub struct RetentionRequest<'a> {
    pub zfs: &'a str,
    pub source_dataset: &'a str,
    pub mirror: &'a str,
    pub destination_writer: &'a RunTarget,
    pub local_snapshots: &'a [SnapshotRecord],
    /// Destination listing taken after the transfer.
    pub remote_snapshots: &'a [SnapshotRecord],
    pub new_snapshot: &'a str,
    pub now_epoch: i64,
    pub retention_secs: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub destroyed_local: Vec<String>,
    pub destroyed_remote: Vec<String>,
    pub failures: Vec<String>,
}

impl RetentionReport {
    pub fn is_empty(&self) -> bool {
        self.destroyed_local.is_empty()
            && self.destroyed_remote.is_empty()
            && self.failures.is_empty()
    }
}

/// Destroy expired snapshots on both sides. Does nothing unless the transfer
/// succeeded. Every deletion is attempted independently.
pub fn enforce(
    runner: &dyn CommandRunner,
    outcome: &JobOutcome,
    req: &RetentionRequest<'_>,
) -> RetentionReport {
    let mut report = RetentionReport::default();
    if !outcome.transfer_succeeded {
        return report;
    }
    for snap in expired(req.local_snapshots, req.now_epoch, req.retention_secs, req.new_snapshot) {
        let local = format!("{}@{}", req.source_dataset, snap.name);
        destroy(
            runner,
            &RunTarget::Local,
            req.zfs,
            &local,
            &mut report.destroyed_local,
            &mut report.failures,
        );

        if req.remote_snapshots.iter().any(|r| r.name == snap.name) {
            let remote = format!("{}@{}", req.mirror, snap.name);
            destroy(
                runner,
                req.destination_writer,
                req.zfs,
                &remote,
                &mut report.destroyed_remote,
                &mut report.failures,
            );
        }
    }
    report
}

fn destroy(
    runner: &dyn CommandRunner,
    target: &RunTarget,
    zfs: &str,
    snapshot: &str,
    destroyed: &mut Vec<String>,
    failures: &mut Vec<String>,
) {
    let cmd = argv([zfs, "destroy", "-r", snapshot]);
    match runner.run(target, &cmd) {
        Ok(out) if out.success() => destroyed.push(snapshot.to_string()),
        Ok(out) => failures.push(format!(
            "failed to destroy {snapshot} on {}: {}",
            target.describe(),
            out.summary()
        )),
        Err(e) => failures.push(format!(
            "failed to destroy {snapshot} on {}: {e}",
            target.describe()
        )),
    }
}
