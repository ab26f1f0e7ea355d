use std::io::{BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;

use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_line;

/// Where a command executes. Remote targets are wrapped in an `ssh` call and,
/// when `elevate` is set, prefixed with the configured elevation command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    Local,
    Remote {
        user: String,
        host: String,
        elevate: bool,
    },
}

impl RunTarget {
    pub fn remote(user: &str, host: &str, elevate: bool) -> Self {
        Self::Remote {
            user: user.to_string(),
            host: host.to_string(),
            elevate,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Local => "local".into(),
            Self::Remote {
                user,
                host,
                elevate,
            } => {
                if *elevate {
                    format!("{user}@{host} (elevated)")
                } else {
                    format!("{user}@{host}")
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn summary(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return sanitize_line(stderr);
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return sanitize_line(stdout);
        }
        format!("exit code {}", self.code)
    }
}

/// One side of a send/receive pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub target: &'a RunTarget,
    pub argv: &'a [String],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeStatus {
    pub send_code: i32,
    pub receive_code: i32,
}

impl PipeStatus {
    /// The receive side is authoritative; a clean receive after a failed send
    /// still counts as a failure.
    pub fn code(&self) -> i32 {
        if self.receive_code != 0 {
            self.receive_code
        } else {
            self.send_code
        }
    }

    pub fn success(&self) -> bool {
        self.code() == 0
    }
}

pub trait CommandRunner {
    fn run(&self, target: &RunTarget, argv: &[String]) -> Result<CmdOutput>;

    /// Stream `send` into `receive`. Every output line of either side is handed
    /// to `on_line` after sanitizing.
    fn pipe(
        &self,
        send: Invocation<'_>,
        receive: Invocation<'_>,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<PipeStatus>;
}

pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

pub fn sh_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Runs commands as real child processes, using `ssh` for remote targets.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    remote: RemoteConfig,
}

impl ProcessRunner {
    pub fn new(remote: RemoteConfig) -> Self {
        Self { remote }
    }

    fn configure_ssh(&self, cmd: &mut Command) {
        cmd.arg("-o").arg("BatchMode=yes");
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.remote.connect_timeout_secs));
        if let Some(port) = self.remote.port {
            cmd.arg("-p").arg(port.to_string());
        }
        if let Some(id) = self
            .remote
            .identity_file
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            cmd.arg("-i").arg(id);
        }
        if let Some(kh) = self
            .remote
            .known_hosts_file
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            cmd.arg("-o").arg(format!("UserKnownHostsFile={kh}"));
        }
        if !self.remote.strict_host_key_checking {
            cmd.arg("-o").arg("StrictHostKeyChecking=no");
            if self.remote.known_hosts_file.is_none() {
                cmd.arg("-o").arg("UserKnownHostsFile=/dev/null");
            }
        }
    }

    pub fn remote_command_line(&self, argv: &[String], elevate: bool) -> String {
        let mut words: Vec<String> = Vec::new();
        if elevate {
            words.extend(
                self.remote
                    .elevate_command
                    .split_whitespace()
                    .map(ToOwned::to_owned),
            );
        }
        words.extend(argv.iter().map(|a| sh_quote(a)));
        words.join(" ")
    }

    pub fn command(&self, target: &RunTarget, argv: &[String]) -> Result<Command> {
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::msg("empty command line"));
        };
        match target {
            RunTarget::Local => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                Ok(cmd)
            }
            RunTarget::Remote {
                user,
                host,
                elevate,
            } => {
                let mut cmd = Command::new(&self.remote.ssh);
                self.configure_ssh(&mut cmd);
                cmd.arg(format!("{user}@{host}"))
                    .arg(self.remote_command_line(argv, *elevate));
                Ok(cmd)
            }
        }
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, target: &RunTarget, argv: &[String]) -> Result<CmdOutput> {
        let mut cmd = self.command(target, argv)?;
        tracing::debug!(on = %target.describe(), command = %argv.join(" "), "run");
        let out = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::msg(format!("failed to run {:?}: {e}", cmd)))?;
        Ok(CmdOutput {
            code: exit_code(out.status),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    fn pipe(
        &self,
        send: Invocation<'_>,
        receive: Invocation<'_>,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<PipeStatus> {
        tracing::debug!(
            send = %send.argv.join(" "),
            receive = %receive.argv.join(" "),
            receive_target = %receive.target.describe(),
            "pipe"
        );
        let mut send_cmd = self.command(send.target, send.argv)?;
        let mut recv_cmd = self.command(receive.target, receive.argv)?;

        let mut sender = send_cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to spawn send side: {e}")))?;
        let Some(stream) = sender.stdout.take() else {
            reap(&mut sender);
            return Err(Error::msg("send side has no stdout"));
        };

        let mut receiver = match recv_cmd
            .stdin(Stdio::from(stream))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                reap(&mut sender);
                return Err(Error::msg(format!("failed to spawn receive side: {e}")));
            }
        };

        // The commands still hold the stream's read end. Release it so the
        // send side sees EPIPE when the receiver exits early.
        drop(recv_cmd);
        drop(send_cmd);

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(err) = sender.stderr.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || read_output_stream(err, tx)));
        }
        if let Some(out) = receiver.stdout.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || read_output_stream(out, tx)));
        }
        if let Some(err) = receiver.stderr.take() {
            let tx = tx.clone();
            readers.push(std::thread::spawn(move || read_output_stream(err, tx)));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_line(&line);
            if !line.is_empty() {
                on_line(&line);
            }
        }
        for r in readers {
            let _ = r.join();
        }

        let receive_status = receiver
            .wait()
            .map_err(|e| Error::msg(format!("wait on receive side failed: {e}")))?;
        let send_status = sender
            .wait()
            .map_err(|e| Error::msg(format!("wait on send side failed: {e}")))?;
        Ok(PipeStatus {
            send_code: exit_code(send_status),
            receive_code: exit_code(receive_status),
        })
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    // Killed by a signal (e.g. SIGPIPE on the send side).
    status.code().unwrap_or(-1)
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                if !pending.is_empty() {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
                continue;
            }
            pending.push(b);
            if pending.len() >= MAX_PENDING_BYTES {
                let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                pending.clear();
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}
