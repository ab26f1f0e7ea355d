use chrono::{DateTime, TimeZone};
use serde::Serialize;

use crate::inventory::SnapshotRecord;

/// How the destination catches up to the new snapshot. Labels are the part
/// after `@`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Baseline {
    Full,
    Incremental { from: String },
    /// `-I from -> through`, then the main incremental `through -> new`.
    Bridging { from: String, through: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferPlan {
    pub source_dataset: String,
    pub mirror: String,
    pub new_snapshot: String,
    pub baseline: Baseline,
    pub raw: bool,
    pub resumable: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PlanInputs<'a> {
    pub source_dataset: &'a str,
    pub mirror: &'a str,
    /// Pre-existing local snapshots, newest first, listed before `new_snapshot`
    /// was taken.
    pub local_snapshots: &'a [SnapshotRecord],
    pub remote_snapshots: &'a [SnapshotRecord],
    pub new_snapshot: &'a str,
    pub raw: bool,
    pub resumable: bool,
}

pub fn plan(inputs: PlanInputs<'_>) -> TransferPlan {
    let baseline = match inputs.local_snapshots.first() {
        None => Baseline::Full,
        Some(last_local) => {
            let on_remote = inputs
                .remote_snapshots
                .iter()
                .any(|r| r.name == last_local.name);
            match inputs.remote_snapshots.first() {
                Some(remote_newest) if !on_remote => Baseline::Bridging {
                    from: remote_newest.name.clone(),
                    through: last_local.name.clone(),
                },
                // Either the destination has it, or it has nothing at all and
                // the receive side decides.
                _ => Baseline::Incremental {
                    from: last_local.name.clone(),
                },
            }
        }
    };
    TransferPlan {
        source_dataset: inputs.source_dataset.to_string(),
        mirror: inputs.mirror.to_string(),
        new_snapshot: inputs.new_snapshot.to_string(),
        baseline,
        raw: inputs.raw,
        resumable: inputs.resumable,
    }
}

/// One send/receive pair, ready to hand to the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stream {
    pub label: String,
    pub send: Vec<String>,
    pub receive: Vec<String>,
}

impl TransferPlan {
    pub fn snapshot(&self, label: &str) -> String {
        format!("{}@{}", self.source_dataset, label)
    }

    pub fn new_snapshot_full(&self) -> String {
        self.snapshot(&self.new_snapshot)
    }

    fn send(&self, zfs: &str, tail: &[String]) -> Vec<String> {
        let mut argv = vec![zfs.to_string(), "send".into(), "-R".into(), "-v".into()];
        if self.raw {
            argv.push("-w".into());
        }
        argv.extend_from_slice(tail);
        argv
    }

    /// Streams in execution order: the bridge (if any) precedes the main one.
    pub fn streams(&self, zfs: &str) -> Vec<Stream> {
        let receive = receive_argv(zfs, &self.mirror, self.resumable);
        let new = self.new_snapshot_full();
        let mut out = Vec::with_capacity(2);
        let main_from = match &self.baseline {
            Baseline::Full => None,
            Baseline::Incremental { from } => Some(from),
            Baseline::Bridging { from, through } => {
                out.push(Stream {
                    label: format!("bridge {from} -> {through}"),
                    send: self.send(zfs, &["-I".into(), self.snapshot(from), self.snapshot(through)]),
                    receive: receive.clone(),
                });
                Some(through)
            }
        };
        out.push(match main_from {
            None => Stream {
                label: format!("full {}", self.new_snapshot),
                send: self.send(zfs, std::slice::from_ref(&new)),
                receive,
            },
            Some(from) => Stream {
                label: format!("incremental {from} -> {}", self.new_snapshot),
                send: self.send(zfs, &["-i".into(), self.snapshot(from), new]),
                receive,
            },
        });
        out
    }

    pub fn describe(&self) -> String {
        let kind = match &self.baseline {
            Baseline::Full => format!("full {}", self.new_snapshot),
            Baseline::Incremental { from } => format!("incremental {from} -> {}", self.new_snapshot),
            Baseline::Bridging { from, through } => format!(
                "bridging {from} -> {through}, then {through} -> {}",
                self.new_snapshot
            ),
        };
        let mut flags = Vec::new();
        if self.raw {
            flags.push("raw");
        }
        if self.resumable {
            flags.push("resumable");
        }
        if flags.is_empty() {
            format!("{} => {}: {kind}", self.source_dataset, self.mirror)
        } else {
            format!(
                "{} => {}: {kind} [{}]",
                self.source_dataset,
                self.mirror,
                flags.join(",")
            )
        }
    }
}

pub fn receive_argv(zfs: &str, mirror: &str, resumable: bool) -> Vec<String> {
    let mut argv = vec![zfs.to_string(), "receive".into(), "-F".into(), "-u".into()];
    if resumable {
        argv.push("-s".into());
    }
    argv.push(mirror.to_string());
    argv
}

/// Continue an interrupted receive from its saved token.
pub fn resume_stream(zfs: &str, token: &str, mirror: &str) -> Stream {
    Stream {
        label: "resume".into(),
        send: vec![zfs.to_string(), "send".into(), "-t".into(), token.to_string()],
        receive: receive_argv(zfs, mirror, true),
    }
}

pub fn snapshot_label<Tz: TimeZone>(prefix: &str, at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{prefix}_{}", at.format("%Y-%m-%d_%H.%M.%S"))
}
