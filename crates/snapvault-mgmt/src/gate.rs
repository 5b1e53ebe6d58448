//! Remote front-end run as a forced ssh command on the receiving host.
//!
//! The sender only ever asks for `list <dir>` or `materialize <dir>`. The
//! request arrives in `SSH_ORIGINAL_COMMAND`; anything else, or a directory
//! outside the allow-list, is refused with [`GATE_DENIED_STATUS`].

use regex::Regex;
use snapvault_repl::cancel::detached;
use snapvault_repl::tools::list_local_dir;
use snapvault_repl::{CancelToken, ProcessInvoker, Result, ToolInvoker, VaultError};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

pub use snapvault_repl::GATE_DENIED_STATUS;

/// Environment variable sshd stores the client's command in.
pub const ORIGINAL_COMMAND_VAR: &str = "SSH_ORIGINAL_COMMAND";

/// Why a request was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateRefusal {
    #[error("no command given")]
    MissingCommand,

    #[error("operation not permitted: {0}")]
    UnknownOperation(String),

    #[error("{op} requires a directory")]
    MissingPath { op: String },

    #[error("path must be absolute: {0}")]
    RelativePath(String),

    #[error("path must not contain '..': {0}")]
    ParentComponent(String),

    #[error("path not in allow-list: {0}")]
    NotAllowed(String),
}

/// One accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateRequest {
    List(PathBuf),
    Materialize(PathBuf),
}

impl GateRequest {
    /// Parse `list <path>` or `materialize <path>`. The path is the rest of
    /// the line, so it may contain spaces.
    pub fn parse(command: &str) -> std::result::Result<Self, GateRefusal> {
        let command = command.trim();
        if command.is_empty() {
            return Err(GateRefusal::MissingCommand);
        }
        let (op, rest) = command.split_once(char::is_whitespace).unwrap_or((command, ""));
        let path = rest.trim();
        let build: fn(PathBuf) -> GateRequest = match op {
            "list" => GateRequest::List,
            "materialize" => GateRequest::Materialize,
            other => return Err(GateRefusal::UnknownOperation(other.to_string())),
        };
        if path.is_empty() {
            return Err(GateRefusal::MissingPath { op: op.to_string() });
        }
        let path = Path::new(path);
        if !path.is_absolute() {
            return Err(GateRefusal::RelativePath(path.display().to_string()));
        }
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(GateRefusal::ParentComponent(path.display().to_string()));
        }
        Ok(build(path.to_path_buf()))
    }

    pub fn op(&self) -> &'static str {
        match self {
            GateRequest::List(_) => "list",
            GateRequest::Materialize(_) => "materialize",
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            GateRequest::List(p) | GateRequest::Materialize(p) => p,
        }
    }
}

/// Directories the gate serves. Each pattern must match the whole path.
#[derive(Debug, Clone)]
pub struct AllowList {
    patterns: Vec<Regex>,
}

impl AllowList {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        if patterns.is_empty() {
            return Err(VaultError::config("gate needs at least one --allow pattern"));
        }
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("^(?:{})$", p.as_ref()))
                    .map_err(|e| VaultError::config(format!("allow pattern {:?}: {}", p.as_ref(), e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn permits(&self, path: &Path) -> bool {
        match path.to_str() {
            Some(path) => self.patterns.iter().any(|re| re.is_match(path)),
            None => false,
        }
    }

    /// Parse and authorize a raw command line.
    pub fn authorize(&self, command: Option<&str>) -> std::result::Result<GateRequest, GateRefusal> {
        let request = GateRequest::parse(command.unwrap_or(""))?;
        if !self.permits(request.path()) {
            return Err(GateRefusal::NotAllowed(request.path().display().to_string()));
        }
        Ok(request)
    }
}

/// Serves authorized requests on the local host.
pub struct Gate<'a> {
    tools: &'a ProcessInvoker,
}

impl<'a> Gate<'a> {
    pub fn new(tools: &'a ProcessInvoker) -> Self {
        Self { tools }
    }

    pub async fn execute(
        &self,
        request: &GateRequest,
        out: &mut dyn Write,
        cancel: &CancelToken,
    ) -> Result<()> {
        match request {
            GateRequest::List(dir) => list(dir, out).await,
            GateRequest::Materialize(dir) => {
                let before: HashSet<String> = list_local_dir(dir).await?.into_iter().collect();
                info!(dir = %dir.display(), "receiving");
                match self.tools.receive_stdin(dir, cancel).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        error!(dir = %dir.display(), error = %e, "receive failed");
                        remove_new_entries(self.tools, dir, &before).await;
                        Err(e)
                    }
                }
            }
        }
    }
}

async fn list(dir: &Path, out: &mut dyn Write) -> Result<()> {
    let mut names = list_local_dir(dir).await?;
    names.sort();
    for name in names {
        writeln!(out, "{}", name)?;
    }
    out.flush()?;
    Ok(())
}

/// Delete every entry of `dir` not in `before`. Returns what was removed.
pub async fn remove_new_entries(
    tools: &dyn ToolInvoker,
    dir: &Path,
    before: &HashSet<String>,
) -> Vec<PathBuf> {
    let after = match list_local_dir(dir).await {
        Ok(names) => names,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot list for cleanup");
            return Vec::new();
        }
    };
    let token = detached();
    let mut removed = Vec::new();
    for name in after.into_iter().filter(|n| !before.contains(n)) {
        let path = dir.join(&name);
        match tools.delete_snapshot(&path, &token).await {
            Ok(()) => {
                info!(path = %path.display(), "removed partial receive");
                removed.push(path);
            }
            Err(e) => error!(path = %path.display(), error = %e, "cannot remove partial receive"),
        }
    }
    removed
}
