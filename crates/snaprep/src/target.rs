use std::sync::OnceLock;

use regex::Regex;

use crate::config::RemoteConfig;
use crate::dataset;
use crate::runner::{CommandRunner, RunTarget, argv};

/// A parsed destination specifier: `dataset` or `user@host:dataset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Local {
        dataset: String,
    },
    Remote {
        user: String,
        host: String,
        dataset: String,
    },
}

fn remote_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Alphanumeric start; dashes, dots and underscores allowed after it.
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*@").expect("static regex"))
}

impl Endpoint {
    pub fn parse(specifier: &str) -> Result<Self, String> {
        let specifier = specifier.trim();
        if !remote_prefix().is_match(specifier) {
            if specifier.is_empty() {
                return Err("empty destination".into());
            }
            return Ok(Self::Local {
                dataset: specifier.to_string(),
            });
        }
        let Some((login, dataset)) = specifier.split_once(':') else {
            return Err(format!("'{specifier}' names a remote host but no dataset"));
        };
        let (user, host) = login
            .split_once('@')
            .ok_or_else(|| format!("'{specifier}' has no user@host prefix"))?;
        if host.is_empty() || dataset.is_empty() {
            return Err(format!("'{specifier}' must look like user@host:dataset"));
        }
        Ok(Self::Remote {
            user: user.to_string(),
            host: host.to_string(),
            dataset: dataset.to_string(),
        })
    }

    pub fn dataset(&self) -> &str {
        match self {
            Self::Local { dataset } | Self::Remote { dataset, .. } => dataset,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

/// Runner targets for one destination: `reader` for queries, `writer` for
/// receive and destroy.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub endpoint: Endpoint,
    pub reader: RunTarget,
    pub writer: RunTarget,
}

#[derive(Debug, Clone)]
pub enum Resolution {
    Ready(ResolvedTarget),
    Unreachable { who: String, detail: String },
    Missing { dataset: String, on: String },
}

pub fn resolve(
    runner: &dyn CommandRunner,
    remote: &RemoteConfig,
    zfs: &str,
    specifier: &str,
) -> Resolution {
    let endpoint = match Endpoint::parse(specifier) {
        Ok(e) => e,
        Err(detail) => {
            return Resolution::Unreachable {
                who: specifier.to_string(),
                detail,
            };
        }
    };

    let (reader, writer) = match &endpoint {
        Endpoint::Local { .. } => (RunTarget::Local, RunTarget::Local),
        Endpoint::Remote { user, host, .. } => {
            let reader = RunTarget::remote(user, host, false);
            if let Err(detail) = probe(runner, &reader) {
                return Resolution::Unreachable {
                    who: format!("{user}@{host}"),
                    detail,
                };
            }
            let writer = RunTarget::remote(user, host, remote.should_elevate(user));
            (reader, writer)
        }
    };

    if !dataset::exists(runner, &reader, zfs, endpoint.dataset()) {
        return Resolution::Missing {
            dataset: endpoint.dataset().to_string(),
            on: reader.describe(),
        };
    }

    Resolution::Ready(ResolvedTarget {
        endpoint,
        reader,
        writer,
    })
}

fn probe(runner: &dyn CommandRunner, target: &RunTarget) -> Result<(), String> {
    match runner.run(target, &argv(["true"])) {
        Ok(out) if out.success() => Ok(()),
        Ok(out) => Err(out.summary()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_dataset_is_local() {
        assert_eq!(
            Endpoint::parse("pool/backups"),
            Ok(Endpoint::Local {
                dataset: "pool/backups".into()
            })
        );
    }

    #[test]
    fn user_host_prefix_is_remote() {
        let e = Endpoint::parse("backup@remote:pool/backups").expect("parse");
        assert_eq!(
            e,
            Endpoint::Remote {
                user: "backup".into(),
                host: "remote".into(),
                dataset: "pool/backups".into()
            }
        );
        assert!(e.is_remote());
        assert_eq!(e.dataset(), "pool/backups");
    }

    #[test]
    fn dataset_keeps_everything_after_first_colon() {
        let e = Endpoint::parse("root@nas:pool/odd:name").expect("parse");
        assert_eq!(e.dataset(), "pool/odd:name");
    }

    #[test]
    fn user_may_contain_dashes_but_not_start_with_one() {
        let e = Endpoint::parse("backup-host@remote:pool/backups").expect("parse");
        assert!(e.is_remote());
        let e = Endpoint::parse("-x@remote:pool/backups").expect("parse");
        assert!(!e.is_remote());
    }

    #[test]
    fn remote_without_dataset_is_rejected() {
        assert!(Endpoint::parse("root@nas").is_err());
        assert!(Endpoint::parse("root@nas:").is_err());
    }
}
