use serde::Serialize;

use crate::error::Result;
use crate::planner::{Stream, TransferPlan};
use crate::runner::{CommandRunner, Invocation, RunTarget};

/// Result of the transfer stage; retention only runs when it succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub transfer_succeeded: bool,
    pub exit_code: i32,
}

impl JobOutcome {
    pub const SUCCEEDED: JobOutcome = JobOutcome {
        transfer_succeeded: true,
        exit_code: 0,
    };

    pub fn from_code(exit_code: i32) -> Self {
        Self {
            transfer_succeeded: exit_code == 0,
            exit_code,
        }
    }
}

/// Runs one send/receive pair: send locally, receive on `writer`. A runner
/// error (spawn failure and similar) is reported as exit code -1.
pub fn run_stream(
    runner: &dyn CommandRunner,
    writer: &RunTarget,
    stream: &Stream,
    on_line: &mut dyn FnMut(&str),
) -> JobOutcome {
    tracing::info!(stream = %stream.label, "transfer");
    let status: Result<_> = runner.pipe(
        Invocation {
            target: &RunTarget::Local,
            argv: &stream.send,
        },
        Invocation {
            target: writer,
            argv: &stream.receive,
        },
        on_line,
    );
    match status {
        Ok(st) => JobOutcome::from_code(st.code()),
        Err(e) => {
            on_line(&format!("{}: {e}", stream.label));
            JobOutcome::from_code(-1)
        }
    }
}

/// Executes every stream of `plan` in order, stopping at the first failure
/// so a failed bridge never lets the main increment run.
pub fn execute(
    runner: &dyn CommandRunner,
    writer: &RunTarget,
    zfs: &str,
    plan: &TransferPlan,
    on_line: &mut dyn FnMut(&str),
) -> JobOutcome {
    for stream in plan.streams(zfs) {
        let outcome = run_stream(runner, writer, &stream, on_line);
        if !outcome.transfer_succeeded {
            return outcome;
        }
    }
    JobOutcome::SUCCEEDED
}
