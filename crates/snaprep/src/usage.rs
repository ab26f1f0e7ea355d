use serde::Serialize;

use crate::runner::{CommandRunner, RunTarget, argv};

/// Bytes held by snapshots of one dataset at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageSample {
    pub used_by_snapshots: u64,
}

impl UsageSample {
    pub fn delta_to(self, after: UsageSample) -> i64 {
        delta(self.used_by_snapshots, after.used_by_snapshots)
    }
}

/// Missing or unreadable datasets sample as zero; accounting never fails a job.
pub fn sample(
    runner: &dyn CommandRunner,
    target: &RunTarget,
    zfs: &str,
    dataset: &str,
) -> UsageSample {
    let cmd = argv([zfs, "get", "-H", "-p", "-o", "value", "usedbysnapshots", dataset]);
    let used_by_snapshots = match runner.run(target, &cmd) {
        Ok(out) if out.success() => out.stdout.trim().parse::<u64>().unwrap_or(0),
        Ok(_) => 0,
        Err(e) => {
            tracing::debug!(dataset, error = %e, "usage sample failed");
            0
        }
    };
    UsageSample { used_by_snapshots }
}

pub fn delta(before: u64, after: u64) -> i64 {
    let d = i128::from(after) - i128::from(before);
    d.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

const SUFFIXES: [&str; 8] = ["K", "M", "G", "T", "P", "E", "Z", "Y"];

/// Base-1024 size, rounded up: `524288000` is `500M`, `1536` is `1.5K`.
/// Values under ten units keep one decimal.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        return bytes.to_string();
    }
    let mut value = bytes as f64 / 1024.0;
    let mut idx = 0usize;
    while value >= 1024.0 && idx + 1 < SUFFIXES.len() {
        value /= 1024.0;
        idx += 1;
    }
    let (rounded, one_decimal) = loop {
        let tenths = (value * 10.0).ceil() / 10.0;
        let rounded = if tenths < 10.0 { tenths } else { value.ceil() };
        // Rounding up can land on the next unit: 1023.5M prints as 1G.
        if rounded >= 1024.0 && idx + 1 < SUFFIXES.len() {
            value /= 1024.0;
            idx += 1;
            continue;
        }
        break (rounded, tenths < 10.0);
    };
    if one_decimal && rounded.fract() != 0.0 {
        return format!("{rounded:.1}{}", SUFFIXES[idx]);
    }
    format!("{}{}", rounded as u64, SUFFIXES[idx])
}

/// Log line for a non-zero delta; `None` when nothing changed.
pub fn describe_delta(side: &str, dataset: &str, delta: i64) -> Option<String> {
    match delta.signum() {
        0 => None,
        1 => Some(format!(
            "{side} {dataset}: allocated {}",
            format_size(delta.unsigned_abs())
        )),
        _ => Some(format!(
            "{side} {dataset}: freed {}",
            format_size(delta.unsigned_abs())
        )),
    }
}
