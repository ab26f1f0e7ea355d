use crate::runner::{CommandRunner, RunTarget, argv};

/// True when `dataset` answers a query for its `creation` property on
/// `target`. Unreachable hosts, missing datasets and spawn failures are all
/// `false`: callers skip the job, they never abort the batch.
pub fn exists(runner: &dyn CommandRunner, target: &RunTarget, zfs: &str, dataset: &str) -> bool {
    let cmd = argv([zfs, "get", "-H", "-p", "-o", "value", "creation", dataset]);
    match runner.run(target, &cmd) {
        Ok(out) => out.success() && !out.stdout.trim().is_empty(),
        Err(e) => {
            tracing::debug!(dataset, error = %e, "dataset probe failed to run");
            false
        }
    }
}

/// Last path component, used to name the mirror under the destination root.
pub fn basename(dataset: &str) -> &str {
    dataset.rsplit('/').next().unwrap_or(dataset)
}

pub fn pool_of(dataset: &str) -> &str {
    dataset.split('/').next().unwrap_or(dataset)
}

pub fn mirror_path(destination_root: &str, source_dataset: &str) -> String {
    format!(
        "{}/{}",
        destination_root.trim_end_matches('/'),
        basename(source_dataset)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_uses_source_basename() {
        assert_eq!(mirror_path("pool/backups", "tank/data"), "pool/backups/data");
        assert_eq!(mirror_path("pool/backups/", "tank"), "pool/backups/tank");
        assert_eq!(pool_of("tank/a/b"), "tank");
        assert_eq!(basename("tank/a/b"), "b");
    }
}
