use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::error::{Error, Result};

pub mod jobs;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/snaprep/snaprep.toml";

fn default_true() -> bool {
    true
}

fn default_jobs_file() -> PathBuf {
    PathBuf::from("/etc/snaprep/jobs.conf")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/snaprep")
}

fn default_snapshot_prefix() -> String {
    crate::PROGRAM_NAME.into()
}

/// How mutating commands on a remote host get their privileges.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ElevationPolicy {
    /// Elevate unless the remote user is the administrative account.
    #[default]
    UnlessAdmin,
    Always,
}

/// Tri-state override for a detected platform capability.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Detect {
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReportTransport {
    #[default]
    None,
    Mail,
    Sendmail,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub elevation: ElevationPolicy,
    pub admin_user: String,
    pub elevate_command: String,
    pub ssh: String,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
    pub known_hosts_file: Option<String>,
    #[serde(default = "default_true")]
    pub strict_host_key_checking: bool,
    pub connect_timeout_secs: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            elevation: ElevationPolicy::UnlessAdmin,
            admin_user: "root".into(),
            elevate_command: "sudo".into(),
            ssh: "ssh".into(),
            port: None,
            identity_file: None,
            known_hosts_file: None,
            strict_host_key_checking: true,
            connect_timeout_secs: 10,
        }
    }
}

impl RemoteConfig {
    pub fn should_elevate(&self, user: &str) -> bool {
        match self.elevation {
            ElevationPolicy::Always => true,
            ElevationPolicy::UnlessAdmin => user != self.admin_user,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CapabilitiesConfig {
    pub raw_send: Detect,
    pub resumable_receive: Detect,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportConfig {
    pub transport: ReportTransport,
    pub recipient: String,
    pub only_on_failure: bool,
    pub mail_command: String,
    pub sendmail_command: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            transport: ReportTransport::None,
            recipient: "root".into(),
            only_on_failure: false,
            mail_command: "mail".into(),
            sendmail_command: "sendmail".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub syslog: bool,
    pub tag: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
            syslog: false,
            tag: crate::PROGRAM_NAME.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(default = "default_jobs_file")]
    pub jobs_file: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,
    pub tool_path_prefix: String,
    pub remote: RemoteConfig,
    pub capabilities: CapabilitiesConfig,
    pub report: ReportConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            jobs_file: default_jobs_file(),
            log_dir: default_log_dir(),
            snapshot_prefix: default_snapshot_prefix(),
            tool_path_prefix: String::new(),
            remote: RemoteConfig::default(),
            capabilities: CapabilitiesConfig::default(),
            report: ReportConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn zfs(&self) -> String {
        format!("{}zfs", self.tool_path_prefix)
    }

    pub fn zpool(&self) -> String {
        format!("{}zpool", self.tool_path_prefix)
    }

    pub fn validate(&self) -> Result<()> {
        let prefix = self.snapshot_prefix.trim();
        if prefix.is_empty() {
            return Err(Error::msg("snapshot_prefix must not be empty"));
        }
        if prefix.contains(['@', '/', ' ']) {
            return Err(Error::msg(format!(
                "snapshot_prefix '{prefix}' may not contain '@', '/' or spaces"
            )));
        }
        if self.report.transport != ReportTransport::None && self.report.recipient.trim().is_empty()
        {
            return Err(Error::msg("report.recipient is empty"));
        }
        Ok(())
    }
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(overlay_tbl)) => {
            for (k, v) in overlay_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn load_value(path: &Path, chain: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !chain.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config extends cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(base) = value.get("extends").and_then(Value::as_str) {
        out = load_value(&resolve_ref_path(path, base), chain)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }
    merge_values(&mut out, value);

    chain.remove(&canonical);
    Ok(out)
}

pub fn from_value(value: Value) -> Result<EngineConfig> {
    let cfg: EngineConfig = value
        .try_into()
        .map_err(|e| Error::msg(format!("invalid engine config: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load the engine config, following `extends` chains. A missing file at the
/// default location yields the built-in defaults; an explicitly named file
/// must exist.
pub fn load(path: &Path, explicit: bool) -> Result<EngineConfig> {
    if !explicit && !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let mut chain = HashSet::new();
    let value = load_value(path, &mut chain)?;
    from_value(value)
}
