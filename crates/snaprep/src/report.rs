use std::io::Write;
use std::process::{Command, Stdio};

use crate::config::{ReportConfig, ReportTransport};
use crate::error::{Error, Result};

/// A message ready to be piped into the mailer's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub argv: Vec<String>,
    pub payload: String,
}

pub fn should_send(cfg: &ReportConfig, any_failed: bool) -> bool {
    cfg.transport != ReportTransport::None && (!cfg.only_on_failure || any_failed)
}

pub fn compose(cfg: &ReportConfig, run_id: &str, body: &str) -> Option<Delivery> {
    match cfg.transport {
        ReportTransport::None => None,
        ReportTransport::Mail => Some(Delivery {
            argv: vec![
                cfg.mail_command.clone(),
                "-s".into(),
                run_id.to_string(),
                cfg.recipient.clone(),
            ],
            payload: body.to_string(),
        }),
        ReportTransport::Sendmail => Some(Delivery {
            argv: vec![cfg.sendmail_command.clone(), "-t".into()],
            payload: format!(
                "To: {}\nSubject: {run_id}\nContent-Type: text/plain; charset=utf-8\n\n{body}",
                cfg.recipient
            ),
        }),
    }
}

pub fn send(delivery: &Delivery) -> Result<()> {
    let Some((program, args)) = delivery.argv.split_first() else {
        return Err(Error::msg("empty mailer command"));
    };
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::msg(format!("failed to spawn {program}: {e}")))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(delivery.payload.as_bytes())
            .map_err(|e| Error::msg(format!("failed to write report to {program}: {e}")))?;
    }
    let out = child
        .wait_with_output()
        .map_err(|e| Error::msg(format!("wait on {program} failed: {e}")))?;
    if !out.status.success() {
        return Err(Error::msg(format!(
            "{program} exited with {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(())
}

/// Deliver the session log if the configuration asks for it. Returns whether a
/// message was handed to the mailer.
pub fn deliver(cfg: &ReportConfig, run_id: &str, body: &str, any_failed: bool) -> Result<bool> {
    if !should_send(cfg, any_failed) {
        return Ok(false);
    }
    let Some(delivery) = compose(cfg, run_id, body) else {
        return Ok(false);
    };
    send(&delivery)?;
    tracing::info!(recipient = %cfg.recipient, run_id, "report delivered");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_on_failure_gates_delivery() {
        let mut cfg = ReportConfig {
            transport: ReportTransport::Mail,
            only_on_failure: true,
            ..ReportConfig::default()
        };
        assert!(!should_send(&cfg, false));
        assert!(should_send(&cfg, true));
        cfg.transport = ReportTransport::None;
        assert!(!should_send(&cfg, true));
    }

    #[test]
    fn mail_puts_run_id_in_subject() {
        let cfg = ReportConfig {
            transport: ReportTransport::Mail,
            recipient: "ops@example.org".into(),
            ..ReportConfig::default()
        };
        let d = compose(&cfg, "snaprep_2024-01-01_00.00.00", "body").expect("delivery");
        assert_eq!(d.argv, ["mail", "-s", "snaprep_2024-01-01_00.00.00", "ops@example.org"]);
        assert_eq!(d.payload, "body");
    }

    #[test]
    fn sendmail_gets_headers() {
        let cfg = ReportConfig {
            transport: ReportTransport::Sendmail,
            ..ReportConfig::default()
        };
        let d = compose(&cfg, "snaprep_x", "line\n").expect("delivery");
        assert_eq!(d.argv, ["sendmail", "-t"]);
        assert!(d.payload.starts_with("To: root\nSubject: snaprep_x\n"));
        assert!(d.payload.ends_with("\n\nline\n"));
    }

    #[test]
    fn failing_mailer_is_an_error() {
        let d = Delivery {
            argv: vec!["sh".into(), "-c".into(), "cat >/dev/null; exit 4".into()],
            payload: "x".into(),
        };
        assert!(send(&d).is_err());
    }
}
