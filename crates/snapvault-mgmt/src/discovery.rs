//! Locating the external tools at startup.

use crate::config::ToolOverrides;
use snapvault_repl::{Result, ToolPaths, VaultError};
use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolve btrfs, and ssh when `needs_ssh`, from overrides or `search_path`.
pub fn discover_tools(
    overrides: &ToolOverrides,
    needs_ssh: bool,
    search_path: Option<&OsStr>,
) -> Result<ToolPaths> {
    let btrfs = resolve("btrfs", overrides.btrfs.as_deref(), search_path)?;
    let ssh = if needs_ssh {
        Some(resolve("ssh", overrides.ssh.as_deref(), search_path)?)
    } else {
        None
    };
    Ok(ToolPaths { btrfs, ssh })
}

/// Discover against the process `PATH`.
pub fn discover_from_env(overrides: &ToolOverrides, needs_ssh: bool) -> Result<ToolPaths> {
    let path = std::env::var_os("PATH");
    discover_tools(overrides, needs_ssh, path.as_deref())
}

fn resolve(tool: &str, explicit: Option<&Path>, search_path: Option<&OsStr>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if is_executable(path) {
            debug!(tool, path = %path.display(), "using configured tool");
            return Ok(path.to_path_buf());
        }
        return Err(VaultError::ToolUnavailable {
            tool: format!("{} ({} is not executable)", tool, path.display()),
        });
    }
    search_path
        .into_iter()
        .flat_map(std::env::split_paths)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(tool))
        .find(|candidate| is_executable(candidate))
        .inspect(|found| debug!(tool, path = %found.display(), "found tool on PATH"))
        .ok_or_else(|| VaultError::ToolUnavailable {
            tool: tool.to_string(),
        })
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
