//! Boundary to the external tools that create, stream and delete snapshots.
//!
//! Every side effect on a snapshot zone goes through [`ToolInvoker`]. The
//! process-backed implementation drives `btrfs` and `ssh`; tests plug in a
//! recording fake.

use crate::cancel::CancelToken;
use crate::error::{Result, VaultError};
use crate::zone::{RemoteHost, Zone};
use async_trait::async_trait;
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

/// Exit status the remote gate uses when it refuses a request.
pub const GATE_DENIED_STATUS: i32 = 77;

/// What to serialize: a snapshot, optionally as a delta against a parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    /// Snapshot to serialize.
    pub snapshot: PathBuf,
    /// Parent snapshot for an incremental stream.
    pub parent: Option<PathBuf>,
}

impl SendRequest {
    /// Full stream of `snapshot`.
    pub fn full(snapshot: impl Into<PathBuf>) -> Self {
        Self {
            snapshot: snapshot.into(),
            parent: None,
        }
    }

    /// Incremental stream of `snapshot` relative to `parent`.
    pub fn incremental(snapshot: impl Into<PathBuf>, parent: impl Into<PathBuf>) -> Self {
        Self {
            snapshot: snapshot.into(),
            parent: Some(parent.into()),
        }
    }

    /// True for delta streams.
    pub fn is_incremental(&self) -> bool {
        self.parent.is_some()
    }
}

/// External operations the replication engine depends on.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Create a read-only snapshot of `volume` at `dest`.
    async fn create_snapshot(&self, volume: &Path, dest: &Path, cancel: &CancelToken) -> Result<()>;

    /// Delete the snapshot at `path` on this host.
    async fn delete_snapshot(&self, path: &Path, cancel: &CancelToken) -> Result<()>;

    /// Whether a local path already exists.
    async fn exists(&self, path: &Path) -> bool;

    /// Entry names (not paths) in a zone directory.
    async fn list_zone(&self, zone: &Zone, cancel: &CancelToken) -> Result<Vec<String>>;

    /// Stream `send` into a receive at `target`, both running concurrently.
    async fn transfer(&self, send: &SendRequest, target: &Zone, cancel: &CancelToken) -> Result<()>;
}

/// Locations of the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    /// The btrfs binary.
    pub btrfs: PathBuf,
    /// The ssh binary, required only for remote zones.
    pub ssh: Option<PathBuf>,
}

/// [`ToolInvoker`] that spawns real processes.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    tools: ToolPaths,
}

impl ProcessInvoker {
    /// Create an invoker using the given tool locations.
    pub fn new(tools: ToolPaths) -> Self {
        Self { tools }
    }

    /// The configured tools.
    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    fn btrfs(&self) -> Command {
        let mut cmd = Command::new(&self.tools.btrfs);
        cmd.kill_on_drop(true);
        cmd
    }

    fn ssh(&self, remote: &RemoteHost) -> Result<Command> {
        let ssh = self.tools.ssh.as_ref().ok_or_else(|| VaultError::ToolUnavailable {
            tool: "ssh".to_string(),
        })?;
        let mut cmd = Command::new(ssh);
        cmd.kill_on_drop(true);
        cmd.args(ssh_args(remote));
        Ok(cmd)
    }

    /// Producer side of a transfer.
    pub fn send_command(&self, send: &SendRequest) -> Command {
        let mut cmd = self.btrfs();
        cmd.args(send_args(send));
        cmd
    }

    /// Consumer side of a transfer.
    pub fn receive_command(&self, target: &Zone) -> Result<Command> {
        match target {
            Zone::Local { dir } => {
                let mut cmd = self.btrfs();
                cmd.arg("receive").arg(dir);
                Ok(cmd)
            }
            Zone::Remote { host, dir } => {
                let mut cmd = self.ssh(host)?;
                cmd.arg("materialize").arg(dir);
                Ok(cmd)
            }
        }
    }

    /// Receive a stream from this process's stdin into a local directory.
    pub async fn receive_stdin(&self, dir: &Path, cancel: &CancelToken) -> Result<()> {
        let mut cmd = self.btrfs();
        cmd.arg("receive").arg(dir).stdin(Stdio::inherit());
        self.run("receive", cmd, cancel, false).await.map(|_| ())
    }

    async fn run(&self, op: &str, mut cmd: Command, cancel: &CancelToken, via_ssh: bool) -> Result<Vec<u8>> {
        cancel.check()?;
        debug!(op, command = ?cmd.as_std(), "spawning");
        cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());
        let mut child = cmd
            .spawn()
            .map_err(|e| VaultError::transfer(op, format!("spawn failed: {}", e)))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| VaultError::transfer(op, "stdout not captured"))?;

        tokio::select! {
            (status, output) = async {
                let mut buf = Vec::new();
                let read = stdout.read_to_end(&mut buf).await.map(|_| buf);
                (child.wait().await, read)
            } => {
                let status = status.map_err(|e| VaultError::transfer(op, e.to_string()))?;
                let output = output.map_err(|e| VaultError::transfer(op, e.to_string()))?;
                if status.success() {
                    Ok(output)
                } else {
                    Err(status_error(op, target_arg(cmd.as_std()), status, via_ssh))
                }
            }
            reason = cancel.cancelled() => {
                // Reap before returning; callers clean up after the tool.
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(VaultError::Interrupted { reason: reason.to_string() })
            }
        }
    }
}

#[async_trait]
impl ToolInvoker for ProcessInvoker {
    async fn create_snapshot(&self, volume: &Path, dest: &Path, cancel: &CancelToken) -> Result<()> {
        let mut cmd = self.btrfs();
        cmd.args(["subvolume", "snapshot", "-r"]).arg(volume).arg(dest);
        self.run("snapshot", cmd, cancel, false).await.map(|_| ())
    }

    async fn delete_snapshot(&self, path: &Path, cancel: &CancelToken) -> Result<()> {
        let mut cmd = self.btrfs();
        cmd.args(["subvolume", "delete"]).arg(path);
        self.run("delete", cmd, cancel, false).await.map(|_| ())
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::symlink_metadata(path).await.is_ok()
    }

    async fn list_zone(&self, zone: &Zone, cancel: &CancelToken) -> Result<Vec<String>> {
        cancel.check()?;
        match zone {
            Zone::Local { dir } => list_local_dir(dir).await,
            Zone::Remote { host, dir } => {
                let mut cmd = self.ssh(host)?;
                cmd.arg("list").arg(dir).stdin(Stdio::null());
                let stdout = self.run("list", cmd, cancel, true).await?;
                Ok(parse_listing(&stdout))
            }
        }
    }

    async fn transfer(&self, send: &SendRequest, target: &Zone, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;

        let mut producer_cmd = self.send_command(send);
        producer_cmd.stdin(Stdio::null()).stdout(Stdio::piped());
        let mut consumer_cmd = self.receive_command(target)?;
        debug!(producer = ?producer_cmd.as_std(), consumer = ?consumer_cmd.as_std(), "spawning pipe");

        let mut producer = producer_cmd
            .spawn()
            .map_err(|e| VaultError::transfer("send", format!("spawn failed: {}", e)))?;
        let stdout = producer
            .stdout
            .take()
            .ok_or_else(|| VaultError::transfer("send", "stdout not captured"))?;
        let pipe: Stdio = stdout.try_into()?;
        consumer_cmd.stdin(pipe).stdout(Stdio::null());
        let spawned = consumer_cmd.spawn();
        // The command still owns the pipe's read end; the producer only sees
        // EPIPE once it is gone.
        drop(consumer_cmd);
        let mut consumer = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = producer.start_kill();
                let _ = producer.wait().await;
                return Err(VaultError::transfer("receive", format!("spawn failed: {}", e)));
            }
        };

        tokio::select! {
            (sent, received) = async { tokio::join!(producer.wait(), consumer.wait()) } => {
                let sent = sent?;
                let received = received?;
                let dir = target.dir().display().to_string();
                let receive_op = if target.is_remote() { "materialize" } else { "receive" };
                // A refused receiver breaks the producer's pipe; report the refusal.
                if target.is_remote() && received.code() == Some(GATE_DENIED_STATUS) {
                    return Err(status_error(receive_op, dir, received, true));
                }
                // A failed receiver breaks the producer's pipe; report the receiver.
                if !received.success() && (sent.success() || broken_pipe(sent)) {
                    return Err(status_error(receive_op, dir, received, target.is_remote()));
                }
                if !sent.success() {
                    return Err(status_error("send", send.snapshot.display().to_string(), sent, false));
                }
                Ok(())
            }
            reason = cancel.cancelled() => {
                let _ = producer.start_kill();
                let _ = consumer.start_kill();
                let _ = producer.wait().await;
                let _ = consumer.wait().await;
                Err(VaultError::Interrupted { reason: reason.to_string() })
            }
        }
    }
}

/// Arguments for `btrfs send`.
pub fn send_args(send: &SendRequest) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["send".into()];
    if let Some(parent) = &send.parent {
        args.push("-p".into());
        args.push(parent.into());
    }
    args.push(send.snapshot.clone().into());
    args
}

/// Connection arguments for ssh, ending with the login.
pub fn ssh_args(remote: &RemoteHost) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-o".into(), "BatchMode=yes".into()];
    if let Some(port) = remote.port {
        args.push("-p".into());
        args.push(port.to_string().into());
    }
    args.push("-i".into());
    args.push(remote.identity.clone().into());
    args.push(remote.login().into());
    args
}

/// Split newline-delimited listing output into entry names.
pub fn parse_listing(stdout: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Entry names of a local directory. Non UTF-8 names are skipped.
pub async fn list_local_dir(dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(raw) => debug!(dir = %dir.display(), name = ?raw, "skipping non UTF-8 entry"),
        }
    }
    Ok(names)
}

fn status_error(op: &str, path: String, status: ExitStatus, via_ssh: bool) -> VaultError {
    if via_ssh && status.code() == Some(GATE_DENIED_STATUS) {
        return VaultError::Authorization {
            op: op.to_string(),
            path,
        };
    }
    VaultError::transfer(op, format!("{} ({})", status, path))
}

const SIGPIPE: i32 = 13;

/// Killed by SIGPIPE, directly or as reported by a shell wrapper.
fn broken_pipe(status: ExitStatus) -> bool {
    status.signal() == Some(SIGPIPE) || status.code() == Some(128 + SIGPIPE)
}

fn target_arg(cmd: &std::process::Command) -> String {
    cmd.get_args()
        .last()
        .map(|a| a.to_string_lossy().into_owned())
        .unwrap_or_default()
}
