use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use snaprep::config::jobs::{self, ReplicationJob};
use snaprep::config::{self, EngineConfig};
use snaprep::executor::{Clock, Engine, SystemClock};
use snaprep::runner::ProcessRunner;
use snaprep::session::{self, EventSink, RunEvent, SessionLog, StdoutSink, TracingSink};
use snaprep::target::Endpoint;
use snaprep::{PROGRAM_NAME, Result, logging, report};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Engine config TOML (default: $SNAPREP_CONFIG, then /etc/snaprep/snaprep.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Job list to use instead of `jobs_file` from the config
    #[arg(long, global = true)]
    jobs: Option<PathBuf>,
    /// Log level or filter directive; RUST_LOG takes precedence
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Snapshot, replicate and prune every enabled job
    Run,
    /// Show the transfer each enabled job would issue, without changing anything
    Plan {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Parse the job list and print its records
    Check,
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            eprintln!("{PROGRAM_NAME}: {e}");
            ExitCode::from(1)
        }
    }
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let (path, explicit) = match &args.config {
        Some(p) => (p.clone(), true),
        None => match std::env::var("SNAPREP_CONFIG") {
            Ok(p) if !p.trim().is_empty() => (PathBuf::from(p), true),
            _ => (PathBuf::from(config::DEFAULT_CONFIG_PATH), false),
        },
    };
    let mut cfg = config::load(&path, explicit)?;
    if let Some(jobs) = &args.jobs {
        cfg.jobs_file = jobs.clone();
    }
    Ok(cfg)
}

fn run(args: Args) -> Result<()> {
    let cfg = load_config(&args)?;
    let level = args.log_level.as_deref().unwrap_or(&cfg.logging.level);
    logging::init(level, cfg.logging.format)?;
    tracing::debug!(jobs_file = %cfg.jobs_file.display(), "config loaded");

    match args.cmd {
        Command::Run => cmd_run(&cfg),
        Command::Plan { json } => cmd_plan(&cfg, json),
        Command::Check => cmd_check(&cfg.jobs_file),
    }
}

fn cmd_run(cfg: &EngineConfig) -> Result<()> {
    let jobs = jobs::load_jobs(&cfg.jobs_file)?;
    let clock = SystemClock;
    let run_id = session::run_id(PROGRAM_NAME, &clock.now()?);

    let mut log = SessionLog::open(&cfg.log_dir, &run_id)?;
    if cfg.logging.syslog {
        log = log.with_syslog(cfg.logging.tag.clone());
    }
    tracing::info!(run_id = %run_id, log = %log.path().display(), jobs = jobs.len(), "run start");

    let runner = ProcessRunner::new(cfg.remote.clone());
    let engine = Engine::new(cfg, &runner, &clock, &log);
    let summary = engine.run_batch(&run_id, &jobs)?;
    for job in &summary.jobs {
        tracing::info!("{}", job.summary_line());
    }

    let body = log.contents()?;
    match report::deliver(&cfg.report, &run_id, &body, summary.any_failed()) {
        Ok(true) => log.emit(RunEvent::run_info(format!(
            "report sent to {}",
            cfg.report.recipient
        ))),
        Ok(false) => {}
        Err(e) => log.emit(RunEvent::run_notice(format!("report delivery failed: {e}"))),
    }
    Ok(())
}

fn cmd_plan(cfg: &EngineConfig, json: bool) -> Result<()> {
    let jobs = jobs::load_jobs(&cfg.jobs_file)?;
    let runner = ProcessRunner::new(cfg.remote.clone());
    let clock = SystemClock;
    let stdout_sink = StdoutSink;
    let tracing_sink = TracingSink;
    let sink: &dyn EventSink = if json { &tracing_sink } else { &stdout_sink };
    let previews = Engine::new(cfg, &runner, &clock, sink).preview(&jobs)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&previews)?);
        return Ok(());
    }
    for p in &previews {
        match &p.plan {
            Some(plan) => {
                println!("{:>2}. {}", p.ordinal, plan.describe());
                for s in plan.streams(&cfg.zfs()) {
                    println!("      {} | {}", s.send.join(" "), s.receive.join(" "));
                }
            }
            None => println!(
                "{:>2}. {} -> {}: {}",
                p.ordinal,
                p.source_dataset,
                p.destination,
                p.state.as_str()
            ),
        }
    }
    Ok(())
}

fn describe_record(job: &ReplicationJob) -> String {
    let destination = match Endpoint::parse(&job.destination_specifier) {
        Ok(Endpoint::Local { dataset }) => format!("local {dataset}"),
        Ok(Endpoint::Remote {
            user,
            host,
            dataset,
        }) => format!("{user}@{host} {dataset}"),
        Err(e) => format!("invalid destination: {e}"),
    };
    format!(
        "{:>2}. {:<24} -> {:<36} keep {:>3}d  {}",
        job.ordinal,
        job.source_dataset,
        destination,
        job.retention_days,
        if job.enabled { "enabled" } else { "disabled" }
    )
}

fn cmd_check(jobs_file: &Path) -> Result<()> {
    let jobs = jobs::load_jobs(jobs_file)?;
    for job in &jobs {
        println!("{}", describe_record(job));
    }
    let remote = jobs
        .iter()
        .filter(|j| Endpoint::parse(&j.destination_specifier).is_ok_and(|e| e.is_remote()))
        .count();
    println!(
        "{} job(s), {} enabled, {} remote",
        jobs.len(),
        jobs.iter().filter(|j| j.enabled).count(),
        remote
    );
    Ok(())
}
