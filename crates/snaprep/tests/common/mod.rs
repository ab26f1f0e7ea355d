#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc;

use chrono::{DateTime, FixedOffset};

use snaprep::config::EngineConfig;
use snaprep::config::jobs::ReplicationJob;
use snaprep::executor::{Engine, FixedClock, RunSummary};
use snaprep::runner::{CmdOutput, CommandRunner, Invocation, PipeStatus, RunTarget};
use snaprep::session::{ChannelSink, RunEvent};

pub const LOCAL: &str = "local";
pub const MIB: u64 = 1024 * 1024;
pub const DAY: i64 = 86_400;

/// 2024-05-01T12:00:00Z
pub const NOW: i64 = 1_714_564_800;
pub const NEW_LABEL: &str = "snaprep_2024-05-01_12.00.00";

pub fn now() -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339("2024-05-01T12:00:00+00:00").expect("timestamp")
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    /// (label, creation epoch), oldest first.
    pub snapshots: Vec<(String, i64)>,
    pub used_by_snapshots: u64,
    pub encrypted: bool,
    pub resume_token: Option<String>,
}

impl Dataset {
    pub fn has(&self, label: &str) -> bool {
        self.snapshots.iter().any(|(l, _)| l == label)
    }

    pub fn labels(&self) -> Vec<String> {
        self.snapshots.iter().map(|(l, _)| l.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub on: String,
    pub elevated: bool,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeCall {
    pub send: Vec<String>,
    pub receive: Vec<String>,
    pub receive_on: String,
    pub elevated: bool,
}

#[derive(Debug, Default)]
pub struct World {
    pub datasets: BTreeMap<(String, String), Dataset>,
    pub features: BTreeSet<(String, String, String)>,
    pub unreachable: BTreeSet<String>,
    pub list_failures: BTreeSet<(String, String)>,
    pub destroy_failures: BTreeSet<String>,
    pub fail_snapshot: bool,
    pub fail_receive: bool,
    pub calls: Vec<Call>,
    pub pipes: Vec<PipeCall>,
}

/// In-memory pools on any number of hosts, answering the `zfs`/`zpool`
/// command lines the engine issues.
#[derive(Debug, Default)]
pub struct FakeZfs {
    pub world: RefCell<World>,
}

fn host_of(target: &RunTarget) -> (String, bool) {
    match target {
        RunTarget::Local => (LOCAL.to_string(), false),
        RunTarget::Remote {
            user,
            host,
            elevate,
        } => (format!("{user}@{host}"), *elevate),
    }
}

fn split_snapshot(full: &str) -> (&str, &str) {
    full.split_once('@').expect("snapshot name")
}

fn source_snapshots(w: &World, snap: &str) -> Vec<(String, i64)> {
    let (ds, _) = split_snapshot(snap);
    w.datasets
        .get(&(LOCAL.to_string(), ds.to_string()))
        .map(|d| d.snapshots.clone())
        .unwrap_or_default()
}

fn creation_of(snaps: &[(String, i64)], label: &str) -> Option<i64> {
    snaps.iter().find(|(l, _)| l == label).map(|(_, c)| *c)
}

impl FakeZfs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dataset(&self, host: &str, name: &str) {
        self.world
            .borrow_mut()
            .datasets
            .insert((host.into(), name.into()), Dataset::default());
    }

    pub fn add_snapshot(&self, host: &str, dataset: &str, label: &str, creation: i64) {
        let mut w = self.world.borrow_mut();
        let ds = w
            .datasets
            .entry((host.into(), dataset.into()))
            .or_default();
        ds.snapshots.push((label.into(), creation));
        ds.snapshots.sort_by_key(|(_, c)| *c);
    }

    pub fn set_encrypted(&self, host: &str, dataset: &str) {
        if let Some(ds) = self
            .world
            .borrow_mut()
            .datasets
            .get_mut(&(host.to_string(), dataset.to_string()))
        {
            ds.encrypted = true;
        }
    }

    pub fn set_resume_token(&self, host: &str, dataset: &str, token: &str) {
        let mut w = self.world.borrow_mut();
        let ds = w
            .datasets
            .entry((host.into(), dataset.into()))
            .or_default();
        ds.resume_token = Some(token.into());
    }

    pub fn enable_feature(&self, host: &str, pool: &str, feature: &str) {
        self.world
            .borrow_mut()
            .features
            .insert((host.into(), pool.into(), feature.into()));
    }

    pub fn get(&self, host: &str, dataset: &str) -> Option<Dataset> {
        self.world
            .borrow()
            .datasets
            .get(&(host.to_string(), dataset.to_string()))
            .cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.world.borrow().calls.clone()
    }

    pub fn pipes(&self) -> Vec<PipeCall> {
        self.world.borrow().pipes.clone()
    }

    /// Every `zfs <verb>` call, in order.
    pub fn calls_with(&self, verb: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.argv.get(1).is_some_and(|v| v == verb))
            .collect()
    }

    fn zfs(&self, w: &mut World, host: &str, args: &[String]) -> CmdOutput {
        let missing =
            |ds: &str| CmdOutput::failed(1, format!("cannot open '{ds}': dataset does not exist"));
        let Some(last) = args.last().cloned() else {
            return CmdOutput::failed(2, "usage");
        };
        match args[0].as_str() {
            "get" => {
                let prop = args[args.len() - 2].as_str();
                let Some(ds) = w.datasets.get(&(host.to_string(), last.clone())) else {
                    return missing(&last);
                };
                match prop {
                    "creation" => CmdOutput::ok("1600000000\n"),
                    "usedbysnapshots" => CmdOutput::ok(format!("{}\n", ds.used_by_snapshots)),
                    "encryption" if ds.encrypted => CmdOutput::ok("aes-256-gcm\n"),
                    "encryption" => CmdOutput::ok("off\n"),
                    "receive_resume_token" => CmdOutput::ok(format!(
                        "{}\n",
                        ds.resume_token.as_deref().unwrap_or("-")
                    )),
                    other => CmdOutput::failed(2, format!("bad property '{other}'")),
                }
            }
            "list" => {
                if w.list_failures.contains(&(host.to_string(), last.clone())) {
                    return CmdOutput::failed(1, "permission denied");
                }
                let Some(ds) = w.datasets.get(&(host.to_string(), last.clone())) else {
                    return missing(&last);
                };
                let mut out = String::new();
                for (label, creation) in ds.snapshots.iter().rev() {
                    out.push_str(&format!("{last}@{label}\t{creation}\n"));
                }
                CmdOutput::ok(out)
            }
            "snapshot" => {
                if w.fail_snapshot {
                    return CmdOutput::failed(1, "out of space");
                }
                let (ds_name, label) = split_snapshot(&last);
                let Some(ds) = w.datasets.get_mut(&(host.to_string(), ds_name.to_string())) else {
                    return missing(ds_name);
                };
                ds.snapshots.push((label.to_string(), NOW));
                ds.used_by_snapshots += 500 * MIB;
                CmdOutput::ok("")
            }
            "destroy" => {
                if w.destroy_failures.contains(&last) {
                    return CmdOutput::failed(1, format!("cannot destroy '{last}': dataset is busy"));
                }
                let (ds_name, label) = split_snapshot(&last);
                let Some(ds) = w.datasets.get_mut(&(host.to_string(), ds_name.to_string())) else {
                    return missing(ds_name);
                };
                let before = ds.snapshots.len();
                ds.snapshots.retain(|(l, _)| l != label);
                if ds.snapshots.len() == before {
                    return CmdOutput::failed(1, "could not find any snapshots to destroy");
                }
                ds.used_by_snapshots = ds.used_by_snapshots.saturating_sub(100 * MIB);
                CmdOutput::ok("")
            }
            other => CmdOutput::failed(2, format!("unsupported zfs verb '{other}'")),
        }
    }

    fn zpool(&self, w: &World, host: &str, args: &[String]) -> CmdOutput {
        let (Some(prop), Some(pool)) = (args.get(args.len().wrapping_sub(2)), args.last()) else {
            return CmdOutput::failed(2, "usage");
        };
        let feature = prop.trim_start_matches("feature@");
        if w
            .features
            .contains(&(host.to_string(), pool.clone(), feature.to_string()))
        {
            CmdOutput::ok("active\n")
        } else {
            CmdOutput::ok("disabled\n")
        }
    }

    /// Apply a send stream to the receive side. Returns the receive exit code.
    fn receive(&self, w: &mut World, host: &str, send: &[String], mirror: &str) -> (i32, String) {
        let args: Vec<&str> = send
            .iter()
            .skip(2)
            .map(String::as_str)
            .filter(|a| !matches!(*a, "-R" | "-v" | "-w"))
            .collect();
        let key = (host.to_string(), mirror.to_string());

        let incoming: Vec<(String, i64)> = match *args.as_slice() {
            ["-t", token] => {
                let Some(ds) = w.datasets.get_mut(&key) else {
                    return (1, "no resumable receive".into());
                };
                if ds.resume_token.as_deref() != Some(token) {
                    return (1, "resume token mismatch".into());
                }
                ds.resume_token = None;
                ds.used_by_snapshots += 100 * MIB;
                return (0, String::new());
            }
            ["-I", from, through] => {
                let snaps = source_snapshots(w, from);
                let (_, from_label) = split_snapshot(from);
                let (_, through_label) = split_snapshot(through);
                if !w.datasets.get(&key).is_some_and(|d| d.has(from_label)) {
                    return (1, format!("destination does not have {from_label}"));
                }
                let (Some(lo), Some(hi)) = (
                    creation_of(&snaps, from_label),
                    creation_of(&snaps, through_label),
                ) else {
                    return (1, "no such source snapshot".into());
                };
                snaps
                    .into_iter()
                    .filter(|(_, c)| *c > lo && *c <= hi)
                    .collect()
            }
            ["-i", from, to] => {
                let snaps = source_snapshots(w, to);
                let (_, from_label) = split_snapshot(from);
                let (_, to_label) = split_snapshot(to);
                if !w.datasets.get(&key).is_some_and(|d| d.has(from_label)) {
                    return (1, format!("destination does not have {from_label}"));
                }
                match creation_of(&snaps, to_label) {
                    Some(c) => vec![(to_label.to_string(), c)],
                    None => return (1, "no such source snapshot".into()),
                }
            }
            [full] => {
                let snaps = source_snapshots(w, full);
                let (_, label) = split_snapshot(full);
                match creation_of(&snaps, label) {
                    Some(c) => {
                        w.datasets.insert(key.clone(), Dataset::default());
                        vec![(label.to_string(), c)]
                    }
                    None => return (1, "no such source snapshot".into()),
                }
            }
            _ => return (2, format!("unsupported send {args:?}")),
        };

        let ds = w.datasets.entry(key).or_default();
        for snap in incoming {
            ds.snapshots.push(snap);
            ds.used_by_snapshots += 500 * MIB;
        }
        ds.snapshots.sort_by_key(|(_, c)| *c);
        (0, String::new())
    }
}

impl CommandRunner for FakeZfs {
    fn run(&self, target: &RunTarget, argv: &[String]) -> snaprep::Result<CmdOutput> {
        let (host, elevated) = host_of(target);
        let mut w = self.world.borrow_mut();
        w.calls.push(Call {
            on: host.clone(),
            elevated,
            argv: argv.to_vec(),
        });
        if w.unreachable.contains(&host) {
            return Ok(CmdOutput::failed(255, format!("ssh: connect to host {host}: No route to host")));
        }
        let Some((program, args)) = argv.split_first() else {
            return Ok(CmdOutput::failed(2, "empty"));
        };
        let out = if program == "true" {
            CmdOutput::ok("")
        } else if program.ends_with("zpool") {
            self.zpool(&w, &host, args)
        } else if program.ends_with("zfs") {
            self.zfs(&mut w, &host, args)
        } else {
            CmdOutput::failed(127, format!("{program}: command not found"))
        };
        Ok(out)
    }

    fn pipe(
        &self,
        send: Invocation<'_>,
        receive: Invocation<'_>,
        on_line: &mut dyn FnMut(&str),
    ) -> snaprep::Result<PipeStatus> {
        let (host, elevated) = host_of(receive.target);
        let mut w = self.world.borrow_mut();
        w.pipes.push(PipeCall {
            send: send.argv.to_vec(),
            receive: receive.argv.to_vec(),
            receive_on: host.clone(),
            elevated,
        });
        on_line(&format!("send from {}", send.argv.last().map(String::as_str).unwrap_or("")));
        if w.unreachable.contains(&host) {
            on_line("ssh: connection refused");
            return Ok(PipeStatus {
                send_code: 141,
                receive_code: 255,
            });
        }
        if w.fail_receive {
            on_line("cannot receive: destination has been modified");
            return Ok(PipeStatus {
                send_code: 141,
                receive_code: 1,
            });
        }
        let mirror = receive.argv.last().cloned().unwrap_or_default();
        let (code, err) = self.receive(&mut w, &host, send.argv, &mirror);
        if !err.is_empty() {
            on_line(&format!("cannot receive: {err}"));
        }
        Ok(PipeStatus {
            send_code: 0,
            receive_code: code,
        })
    }
}

pub fn job(ordinal: usize, source: &str, destination: &str, days: u32) -> ReplicationJob {
    ReplicationJob {
        ordinal,
        source_dataset: source.into(),
        destination_specifier: destination.into(),
        retention_days: days,
        enabled: true,
    }
}

pub fn run(
    cfg: &EngineConfig,
    fake: &FakeZfs,
    jobs: &[ReplicationJob],
) -> (RunSummary, Vec<RunEvent>) {
    let (tx, rx) = mpsc::channel();
    let sink = ChannelSink::new(tx);
    let clock = FixedClock(now());
    let engine = Engine::new(cfg, fake, &clock, &sink);
    let summary = engine.run_batch("snaprep_test", jobs).expect("run batch");
    drop(engine);
    drop(sink);
    (summary, rx.into_iter().collect())
}

pub fn notices(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Notice { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}
