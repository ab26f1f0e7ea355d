use serde::Serialize;

use crate::config::{CapabilitiesConfig, Detect};
use crate::runner::{CommandRunner, RunTarget, argv};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub encryption_feature_enabled: bool,
    pub resumable_receive_supported: bool,
}

fn feature_on(value: &str) -> bool {
    matches!(value.trim(), "enabled" | "active")
}

fn query(runner: &dyn CommandRunner, target: &RunTarget, cmd: &[String]) -> Option<String> {
    match runner.run(target, cmd) {
        Ok(out) if out.success() => Some(out.stdout.trim().to_string()),
        Ok(out) => {
            tracing::debug!(command = %cmd.join(" "), detail = %out.summary(), "capability query failed");
            None
        }
        Err(e) => {
            tracing::debug!(command = %cmd.join(" "), error = %e, "capability query failed");
            None
        }
    }
}

fn pool_feature(
    runner: &dyn CommandRunner,
    target: &RunTarget,
    zpool: &str,
    pool: &str,
    feature: &str,
) -> bool {
    let cmd = argv([zpool, "get", "-H", "-o", "value", &format!("feature@{feature}"), pool]);
    query(runner, target, &cmd).is_some_and(|v| feature_on(&v))
}

/// Resolve capability flags for one job: `encryption@` on the source pool
/// and `extensible_dataset@` on the destination pool, unless overridden.
pub fn detect(
    runner: &dyn CommandRunner,
    cfg: &CapabilitiesConfig,
    zpool: &str,
    source_pool: &str,
    destination: &RunTarget,
    destination_pool: &str,
) -> Capabilities {
    let encryption_feature_enabled = match cfg.raw_send {
        Detect::On => true,
        Detect::Off => false,
        Detect::Auto => pool_feature(runner, &RunTarget::Local, zpool, source_pool, "encryption"),
    };
    let resumable_receive_supported = match cfg.resumable_receive {
        Detect::On => true,
        Detect::Off => false,
        Detect::Auto => pool_feature(
            runner,
            destination,
            zpool,
            destination_pool,
            "extensible_dataset",
        ),
    };
    Capabilities {
        encryption_feature_enabled,
        resumable_receive_supported,
    }
}

/// Whether `dataset` is encrypted, judged from its `encryption` property.
pub fn encryption_active(runner: &dyn CommandRunner, zfs: &str, dataset: &str) -> bool {
    let cmd = argv([zfs, "get", "-H", "-o", "value", "encryption", dataset]);
    query(runner, &RunTarget::Local, &cmd).is_some_and(|v| !matches!(v.as_str(), "" | "off" | "-"))
}

/// Token left behind by an interrupted resumable receive, if any.
pub fn resume_token(
    runner: &dyn CommandRunner,
    target: &RunTarget,
    zfs: &str,
    dataset: &str,
) -> Option<String> {
    let cmd = argv([zfs, "get", "-H", "-o", "value", "receive_resume_token", dataset]);
    query(runner, target, &cmd).filter(|v| !v.is_empty() && v != "-")
}

#[cfg(test)]
mod tests {
    use super::feature_on;

    #[test]
    fn enabled_and_active_count_as_on() {
        assert!(feature_on("active\n"));
        assert!(feature_on("enabled"));
        assert!(!feature_on("disabled"));
        assert!(!feature_on("-"));
    }
}
