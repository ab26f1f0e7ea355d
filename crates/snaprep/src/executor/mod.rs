use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, FixedOffset, Local};
use serde::Serialize;

use crate::capabilities::{self, Capabilities};
use crate::config::EngineConfig;
use crate::config::jobs::ReplicationJob;
use crate::dataset;
use crate::error::{Error, Result};
use crate::inventory::{self, SnapshotRecord};
use crate::planner::{self, PlanInputs, Stream, TransferPlan};
use crate::retention::{self, RetentionReport, RetentionRequest};
use crate::runner::{CommandRunner, RunTarget, argv};
use crate::session::{EventSink, RunEvent};
use crate::target::{self, Resolution, ResolvedTarget};
use crate::transfer::{self, JobOutcome};
use crate::usage::{self, UsageSample};

pub trait Clock {
    fn now(&self) -> Result<DateTime<FixedOffset>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Result<DateTime<FixedOffset>> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::msg(format!("system clock is before the epoch: {e}")))?;
        Ok(Local::now().fixed_offset())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<FixedOffset>);

impl Clock for FixedClock {
    fn now(&self) -> Result<DateTime<FixedOffset>> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Validating,
    ResolvingTarget,
    Snapshotting,
    Planning,
    Transferring,
    RetentionEnforcing,
    SkippingRetention,
    Accounting,
    Done,
    SkippedDisabled,
    SkippedMissingSource,
    SkippedUnreachableTarget,
    SkippedMissingTarget,
    SkippedInventoryFailure,
    SkippedSnapshotFailure,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done
                | Self::SkippedDisabled
                | Self::SkippedMissingSource
                | Self::SkippedUnreachableTarget
                | Self::SkippedMissingTarget
                | Self::SkippedInventoryFailure
                | Self::SkippedSnapshotFailure
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::ResolvingTarget => "resolving-target",
            Self::Snapshotting => "snapshotting",
            Self::Planning => "planning",
            Self::Transferring => "transferring",
            Self::RetentionEnforcing => "retention-enforcing",
            Self::SkippingRetention => "skipping-retention",
            Self::Accounting => "accounting",
            Self::Done => "done",
            Self::SkippedDisabled => "skipped-disabled",
            Self::SkippedMissingSource => "skipped-missing-source",
            Self::SkippedUnreachableTarget => "skipped-unreachable-target",
            Self::SkippedMissingTarget => "skipped-missing-target",
            Self::SkippedInventoryFailure => "skipped-inventory-failure",
            Self::SkippedSnapshotFailure => "skipped-snapshot-failure",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageDelta {
    pub source: i64,
    pub destination: i64,
}

/// What happened to one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub ordinal: usize,
    pub source_dataset: String,
    pub destination: String,
    pub state: JobState,
    pub new_snapshot: Option<String>,
    pub plan: Option<TransferPlan>,
    pub outcome: Option<JobOutcome>,
    pub retention: RetentionReport,
    pub usage: UsageDelta,
}

impl JobReport {
    /// Disabled jobs are not failures; everything else that did not transfer is.
    pub fn failed(&self) -> bool {
        match self.state {
            JobState::SkippedDisabled => false,
            JobState::Done => !self.outcome.is_some_and(|o| o.transfer_succeeded),
            _ => true,
        }
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "job {}: {} -> {}: {}",
            self.ordinal,
            self.source_dataset,
            self.destination,
            self.state.as_str()
        );
        if let Some(o) = self.outcome {
            if o.transfer_succeeded {
                line.push_str(", transfer ok");
            } else {
                line.push_str(&format!(", transfer failed (exit {})", o.exit_code));
            }
        }
        let destroyed =
            self.retention.destroyed_local.len() + self.retention.destroyed_remote.len();
        if destroyed > 0 {
            line.push_str(&format!(", {destroyed} expired snapshot(s) destroyed"));
        }
        line
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<FixedOffset>,
    pub jobs: Vec<JobReport>,
}

impl RunSummary {
    pub fn any_failed(&self) -> bool {
        self.jobs.iter().any(JobReport::failed)
    }

    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }
}

/// The transfer a job would issue, computed without mutating anything.
#[derive(Debug, Clone, Serialize)]
pub struct JobPreview {
    pub ordinal: usize,
    pub source_dataset: String,
    pub destination: String,
    pub state: JobState,
    pub capabilities: Option<Capabilities>,
    pub plan: Option<TransferPlan>,
    pub streams: Vec<Stream>,
}

/// Per-job state handed from stage to stage.
struct JobContext<'j> {
    job: &'j ReplicationJob,
    now: DateTime<FixedOffset>,
    target: Option<ResolvedTarget>,
    mirror: String,
    capabilities: Capabilities,
    usage_before: (UsageSample, UsageSample),
    local_snapshots: Vec<SnapshotRecord>,
    remote_snapshots: Vec<SnapshotRecord>,
    new_snapshot: Option<String>,
    plan: Option<TransferPlan>,
    outcome: Option<JobOutcome>,
    retention: RetentionReport,
    usage: UsageDelta,
    /// Terminal state to report once accounting has run.
    finish_as: Option<JobState>,
}

impl<'j> JobContext<'j> {
    fn new(job: &'j ReplicationJob, now: DateTime<FixedOffset>) -> Self {
        Self {
            job,
            now,
            target: None,
            mirror: String::new(),
            capabilities: Capabilities::default(),
            usage_before: Default::default(),
            local_snapshots: Vec::new(),
            remote_snapshots: Vec::new(),
            new_snapshot: None,
            plan: None,
            outcome: None,
            retention: RetentionReport::default(),
            usage: UsageDelta::default(),
            finish_as: None,
        }
    }

    fn into_report(self, state: JobState) -> JobReport {
        JobReport {
            ordinal: self.job.ordinal,
            source_dataset: self.job.source_dataset.clone(),
            destination: self.job.destination_specifier.clone(),
            state,
            new_snapshot: self.new_snapshot,
            plan: self.plan,
            outcome: self.outcome,
            retention: self.retention,
            usage: self.usage,
        }
    }
}

pub struct Engine<'a> {
    pub config: &'a EngineConfig,
    pub runner: &'a dyn CommandRunner,
    pub clock: &'a dyn Clock,
    pub sink: &'a dyn EventSink,
}

impl<'a> Engine<'a> {
    pub fn new(
        config: &'a EngineConfig,
        runner: &'a dyn CommandRunner,
        clock: &'a dyn Clock,
        sink: &'a dyn EventSink,
    ) -> Self {
        Self {
            config,
            runner,
            clock,
            sink,
        }
    }

    fn zfs(&self) -> String {
        self.config.zfs()
    }

    fn notice(&self, job: usize, message: impl Into<String>) {
        self.sink.emit(RunEvent::notice(job, message));
    }

    fn info(&self, job: usize, message: impl Into<String>) {
        self.sink.emit(RunEvent::info(job, message));
    }

    /// Run every job in order. The clock is read once, before any job runs,
    /// so only that reading can abort the batch; per-job failures end up in
    /// the summary.
    pub fn run_batch(&self, run_id: &str, jobs: &[ReplicationJob]) -> Result<RunSummary> {
        let started_at = self.clock.now()?;
        self.sink.emit(RunEvent::run_info(format!(
            "{run_id}: starting {} job(s)",
            jobs.len()
        )));
        let mut reports = Vec::with_capacity(jobs.len());
        for job in jobs {
            let report = self.run_job(job, started_at);
            self.sink.emit(RunEvent::JobFinished {
                job: job.ordinal,
                state: report.state.as_str().to_string(),
            });
            reports.push(report);
        }
        let summary = RunSummary {
            run_id: run_id.to_string(),
            started_at,
            jobs: reports,
        };
        for job in &summary.jobs {
            self.sink.emit(RunEvent::run_info(job.summary_line()));
        }
        Ok(summary)
    }

    /// Drive one job to a terminal state. `now` names the new snapshot and
    /// ages existing ones.
    pub fn run_job(&self, job: &ReplicationJob, now: DateTime<FixedOffset>) -> JobReport {
        let mut ctx = JobContext::new(job, now);
        let span = tracing::info_span!(
            "job",
            job = job.ordinal,
            source = %job.source_dataset,
            destination = %job.destination_specifier
        );
        let _enter = span.enter();

        let mut state = if job.enabled {
            JobState::Validating
        } else {
            self.info(job.ordinal, format!("{} is disabled", job.source_dataset));
            JobState::SkippedDisabled
        };
        let terminal = loop {
            tracing::debug!(state = state.as_str(), "stage");
            state = match state {
                JobState::Validating => self.validate(&ctx),
                JobState::ResolvingTarget => self.resolve_target(&mut ctx),
                JobState::Snapshotting => self.snapshot(&mut ctx),
                JobState::Planning => self.plan(&mut ctx),
                JobState::Transferring => self.transfer(&mut ctx),
                JobState::RetentionEnforcing => self.enforce_retention(&mut ctx),
                JobState::SkippingRetention => self.skip_retention(&ctx),
                JobState::Accounting => self.account(&mut ctx),
                done => {
                    debug_assert!(done.is_terminal());
                    break done;
                }
            };
        };
        ctx.into_report(terminal)
    }

    fn validate(&self, ctx: &JobContext<'_>) -> JobState {
        let source = &ctx.job.source_dataset;
        if dataset::exists(self.runner, &RunTarget::Local, &self.zfs(), source) {
            JobState::ResolvingTarget
        } else {
            self.notice(
                ctx.job.ordinal,
                format!("source dataset {source} does not exist, skipping"),
            );
            JobState::SkippedMissingSource
        }
    }

    fn resolve_target(&self, ctx: &mut JobContext<'_>) -> JobState {
        let job = ctx.job;
        let resolved = match target::resolve(
            self.runner,
            &self.config.remote,
            &self.zfs(),
            &job.destination_specifier,
        ) {
            Resolution::Ready(t) => t,
            Resolution::Unreachable { who, detail } => {
                self.notice(
                    job.ordinal,
                    format!("cannot reach {who} ({detail}), skipping {}", job.source_dataset),
                );
                return JobState::SkippedUnreachableTarget;
            }
            Resolution::Missing { dataset, on } => {
                self.notice(
                    job.ordinal,
                    format!("destination dataset {dataset} does not exist on {on}, skipping"),
                );
                return JobState::SkippedMissingTarget;
            }
        };

        ctx.mirror = dataset::mirror_path(resolved.endpoint.dataset(), &job.source_dataset);
        ctx.capabilities = capabilities::detect(
            self.runner,
            &self.config.capabilities,
            &self.config.zpool(),
            dataset::pool_of(&job.source_dataset),
            &resolved.reader,
            dataset::pool_of(resolved.endpoint.dataset()),
        );
        ctx.target = Some(resolved);
        JobState::Snapshotting
    }

    /// Usage baseline, resume, inventories, then the new snapshot.
    fn snapshot(&self, ctx: &mut JobContext<'_>) -> JobState {
        let Some(t) = ctx.target.clone() else {
            return JobState::SkippedUnreachableTarget;
        };
        let job = ctx.job;
        let zfs = self.zfs();

        ctx.usage_before = (
            usage::sample(self.runner, &RunTarget::Local, &zfs, &job.source_dataset),
            usage::sample(self.runner, &t.reader, &zfs, &ctx.mirror),
        );

        let token = if ctx.capabilities.resumable_receive_supported {
            capabilities::resume_token(self.runner, &t.reader, &zfs, &ctx.mirror)
        } else {
            None
        };
        if let Some(token) = token {
            self.info(
                job.ordinal,
                format!("resuming interrupted receive into {}", ctx.mirror),
            );
            let stream = planner::resume_stream(&zfs, &token, &ctx.mirror);
            let outcome = self.run_stream(job.ordinal, &t.writer, &stream);
            if !outcome.transfer_succeeded {
                self.notice(
                    job.ordinal,
                    format!(
                        "resume of {} into {} failed with exit code {}",
                        job.source_dataset, ctx.mirror, outcome.exit_code
                    ),
                );
                ctx.outcome = Some(outcome);
                return JobState::SkippingRetention;
            }
        }

        match self.inventories(job, &t.reader, &ctx.mirror) {
            Ok((local, remote)) => {
                ctx.local_snapshots = local;
                ctx.remote_snapshots = remote;
            }
            Err(e) => {
                self.notice(job.ordinal, format!("snapshot inventory failed: {e}, skipping"));
                return JobState::SkippedInventoryFailure;
            }
        }

        let label = planner::snapshot_label(&self.config.snapshot_prefix, &ctx.now);
        let full = format!("{}@{label}", job.source_dataset);
        let res = self
            .runner
            .run(&RunTarget::Local, &argv([zfs.as_str(), "snapshot", "-r", &full]));
        match res {
            Ok(out) if out.success() => {
                self.info(job.ordinal, format!("created {full}"));
                ctx.new_snapshot = Some(label);
                JobState::Planning
            }
            Ok(out) => {
                self.notice(
                    job.ordinal,
                    format!("failed to create {full}: {}", out.summary()),
                );
                ctx.finish_as = Some(JobState::SkippedSnapshotFailure);
                JobState::Accounting
            }
            Err(e) => {
                self.notice(job.ordinal, format!("failed to create {full}: {e}"));
                ctx.finish_as = Some(JobState::SkippedSnapshotFailure);
                JobState::Accounting
            }
        }
    }

    fn inventories(
        &self,
        job: &ReplicationJob,
        reader: &RunTarget,
        mirror: &str,
    ) -> Result<(Vec<SnapshotRecord>, Vec<SnapshotRecord>)> {
        let zfs = self.zfs();
        let local = inventory::list(self.runner, &RunTarget::Local, &zfs, &job.source_dataset)?;
        let remote = inventory::list(self.runner, reader, &zfs, mirror)?;
        Ok((local, remote))
    }

    fn plan(&self, ctx: &mut JobContext<'_>) -> JobState {
        let Some(new_snapshot) = ctx.new_snapshot.as_deref() else {
            return JobState::Accounting;
        };
        let raw = ctx.capabilities.encryption_feature_enabled
            && capabilities::encryption_active(self.runner, &self.zfs(), &ctx.job.source_dataset);
        let plan = planner::plan(PlanInputs {
            source_dataset: &ctx.job.source_dataset,
            mirror: &ctx.mirror,
            local_snapshots: &ctx.local_snapshots,
            remote_snapshots: &ctx.remote_snapshots,
            new_snapshot,
            raw,
            resumable: ctx.capabilities.resumable_receive_supported,
        });
        self.info(ctx.job.ordinal, plan.describe());
        ctx.plan = Some(plan);
        JobState::Transferring
    }

    fn run_stream(&self, ordinal: usize, writer: &RunTarget, stream: &Stream) -> JobOutcome {
        let sink = self.sink;
        transfer::run_stream(self.runner, writer, stream, &mut |line: &str| {
            sink.emit(RunEvent::Output {
                job: ordinal,
                line: line.to_string(),
            })
        })
    }

    fn transfer(&self, ctx: &mut JobContext<'_>) -> JobState {
        let (Some(plan), Some(t)) = (ctx.plan.as_ref(), ctx.target.as_ref()) else {
            return JobState::SkippingRetention;
        };
        let ordinal = ctx.job.ordinal;
        let sink = self.sink;
        let mut on_line = |line: &str| {
            sink.emit(RunEvent::Output {
                job: ordinal,
                line: line.to_string(),
            })
        };
        let outcome = transfer::execute(self.runner, &t.writer, &self.zfs(), plan, &mut on_line);
        ctx.outcome = Some(outcome);
        if outcome.transfer_succeeded {
            JobState::RetentionEnforcing
        } else {
            self.notice(
                ordinal,
                format!(
                    "transfer {} -> {} failed with exit code {}",
                    ctx.job.source_dataset, ctx.job.destination_specifier, outcome.exit_code
                ),
            );
            JobState::SkippingRetention
        }
    }

    fn enforce_retention(&self, ctx: &mut JobContext<'_>) -> JobState {
        let (Some(outcome), Some(t), Some(new_snapshot)) =
            (ctx.outcome, ctx.target.as_ref(), ctx.new_snapshot.as_deref())
        else {
            return JobState::Accounting;
        };
        let zfs = self.zfs();
        let ordinal = ctx.job.ordinal;
        let remote_after = match inventory::list(self.runner, &t.reader, &zfs, &ctx.mirror) {
            Ok(list) => list,
            Err(e) => {
                self.notice(
                    ordinal,
                    format!(
                        "cannot list {} after transfer ({e}); remote retention skipped",
                        ctx.mirror
                    ),
                );
                Vec::new()
            }
        };
        let report = retention::enforce(
            self.runner,
            &outcome,
            &RetentionRequest {
                zfs: &zfs,
                source_dataset: &ctx.job.source_dataset,
                mirror: &ctx.mirror,
                destination_writer: &t.writer,
                local_snapshots: &ctx.local_snapshots,
                remote_snapshots: &remote_after,
                new_snapshot,
                now_epoch: ctx.now.timestamp(),
                retention_secs: ctx.job.retention_secs(),
            },
        );
        for name in report.destroyed_local.iter().chain(&report.destroyed_remote) {
            self.notice(ordinal, format!("destroyed expired snapshot {name}"));
        }
        for failure in &report.failures {
            self.notice(ordinal, failure.clone());
        }
        ctx.retention = report;
        JobState::Accounting
    }

    fn skip_retention(&self, ctx: &JobContext<'_>) -> JobState {
        self.info(ctx.job.ordinal, "retention skipped after failed transfer");
        JobState::Accounting
    }

    fn account(&self, ctx: &mut JobContext<'_>) -> JobState {
        let finish = ctx.finish_as.take().unwrap_or(JobState::Done);
        let Some(t) = ctx.target.as_ref() else {
            return finish;
        };
        let zfs = self.zfs();
        let source_after =
            usage::sample(self.runner, &RunTarget::Local, &zfs, &ctx.job.source_dataset);
        let mirror_after = usage::sample(self.runner, &t.reader, &zfs, &ctx.mirror);
        ctx.usage = UsageDelta {
            source: ctx.usage_before.0.delta_to(source_after),
            destination: ctx.usage_before.1.delta_to(mirror_after),
        };
        let lines = [
            usage::describe_delta("local", &ctx.job.source_dataset, ctx.usage.source),
            usage::describe_delta(&t.reader.describe(), &ctx.mirror, ctx.usage.destination),
        ];
        for line in lines.into_iter().flatten() {
            self.notice(ctx.job.ordinal, line);
        }
        finish
    }

    /// Validate, resolve and list, then compute each enabled job's plan with
    /// the label a run at this moment would use. Nothing is created, sent or
    /// destroyed.
    pub fn preview(&self, jobs: &[ReplicationJob]) -> Result<Vec<JobPreview>> {
        let now = self.clock.now()?;
        let label = planner::snapshot_label(&self.config.snapshot_prefix, &now);
        let zfs = self.zfs();
        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            let mut preview = JobPreview {
                ordinal: job.ordinal,
                source_dataset: job.source_dataset.clone(),
                destination: job.destination_specifier.clone(),
                state: JobState::Planning,
                capabilities: None,
                plan: None,
                streams: Vec::new(),
            };
            let mut ctx = JobContext::new(job, now);
            let mut state = if job.enabled {
                self.validate(&ctx)
            } else {
                JobState::SkippedDisabled
            };
            if state == JobState::ResolvingTarget {
                state = self.resolve_target(&mut ctx);
            }
            if let (JobState::Snapshotting, Some(t)) = (state, ctx.target.as_ref()) {
                match self.inventories(job, &t.reader, &ctx.mirror) {
                    Ok((local, remote)) => {
                        let raw = ctx.capabilities.encryption_feature_enabled
                            && capabilities::encryption_active(
                                self.runner,
                                &zfs,
                                &job.source_dataset,
                            );
                        let plan = planner::plan(PlanInputs {
                            source_dataset: &job.source_dataset,
                            mirror: &ctx.mirror,
                            local_snapshots: &local,
                            remote_snapshots: &remote,
                            new_snapshot: &label,
                            raw,
                            resumable: ctx.capabilities.resumable_receive_supported,
                        });
                        preview.streams = plan.streams(&zfs);
                        preview.plan = Some(plan);
                        preview.capabilities = Some(ctx.capabilities);
                    }
                    Err(e) => {
                        self.notice(job.ordinal, format!("snapshot inventory failed: {e}"));
                        state = JobState::SkippedInventoryFailure;
                    }
                }
            }
            if preview.plan.is_none() {
                preview.state = state;
            }
            out.push(preview);
        }
        Ok(out)
    }
}
