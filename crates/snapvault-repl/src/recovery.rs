//! Rollback of partially received snapshots.
//!
//! A compensation is pushed immediately before a step that can leave a
//! half-written artifact behind and popped as soon as that step commits.
//! Whatever is still on the stack when the run fails or is interrupted is
//! executed by [`CompensationStack::run_all_armed`] before the process exits.

use crate::cancel;
use crate::error::{Result, VaultError};
use crate::tools::ToolInvoker;
use crate::zone::Zone;
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const CONFIRM_ATTEMPTS: u32 = 3;
const CONFIRM_DELAY: Duration = Duration::from_millis(500);

/// A pending rollback action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Delete a local snapshot.
    DeleteSnapshot {
        /// Snapshot path.
        path: PathBuf,
    },
    /// The remote gate removes its own partial receive; verify it did.
    ConfirmRemoteAbsent {
        /// Remote zone the snapshot was streamed to.
        zone: Zone,
        /// Snapshot name inside the zone.
        name: String,
    },
}

impl Compensation {
    /// Compensation undoing a partial receive of `name` into `target`.
    pub fn for_partial_receive(target: &Zone, name: &str) -> Self {
        match target {
            Zone::Local { dir } => Compensation::DeleteSnapshot {
                path: dir.join(name),
            },
            Zone::Remote { .. } => Compensation::ConfirmRemoteAbsent {
                zone: target.clone(),
                name: name.to_string(),
            },
        }
    }

    async fn run(&self, tools: &dyn ToolInvoker) -> Result<()> {
        // The main token has usually fired by now; rollback must still run.
        let token = cancel::detached();
        match self {
            Compensation::DeleteSnapshot { path } => {
                if !tools.exists(path).await {
                    info!(path = %path.display(), "nothing to roll back");
                    return Ok(());
                }
                tools.delete_snapshot(path, &token).await
            }
            Compensation::ConfirmRemoteAbsent { zone, name } => {
                // The gate cleans up after its session ends, possibly after we look.
                for attempt in 1..=CONFIRM_ATTEMPTS {
                    let names = tools.list_zone(zone, &token).await?;
                    if !names.iter().any(|n| n == name) {
                        return Ok(());
                    }
                    if attempt < CONFIRM_ATTEMPTS {
                        info!(zone = %zone, name = %name, attempt, "partial snapshot still listed, re-checking");
                        tokio::time::sleep(CONFIRM_DELAY).await;
                    }
                }
                Err(VaultError::transfer(
                    "rollback",
                    format!("could not confirm removal of partial snapshot {} from {}", name, zone),
                ))
            }
        }
    }
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compensation::DeleteSnapshot { path } => write!(f, "delete {}", path.display()),
            Compensation::ConfirmRemoteAbsent { zone, name } => {
                write!(f, "confirm {} absent from {}", name, zone)
            }
        }
    }
}

/// Result of running one compensation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationOutcome {
    /// The rollback action succeeded.
    Completed(Compensation),
    /// The rollback action failed; manual cleanup is needed.
    Failed {
        /// The action that failed.
        compensation: Compensation,
        /// Why it failed.
        error: String,
    },
}

impl CompensationOutcome {
    /// True if the action succeeded.
    pub fn is_completed(&self) -> bool {
        matches!(self, CompensationOutcome::Completed(_))
    }
}

/// Stack of pending compensations shared by the pipeline and the abort path.
#[derive(Debug, Clone, Default)]
pub struct CompensationStack {
    pending: Arc<Mutex<Vec<Compensation>>>,
}

impl CompensationStack {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a compensation.
    pub fn push(&self, compensation: Compensation) {
        self.pending.lock().push(compensation);
    }

    /// Disarm the most recently armed compensation.
    pub fn pop(&self) -> Option<Compensation> {
        self.pending.lock().pop()
    }

    /// Whether any compensation is pending.
    pub fn is_armed(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Number of pending compensations.
    pub fn depth(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run every pending compensation once, newest first, and clear them.
    /// Calling it again with nothing armed does nothing.
    pub async fn run_all_armed(&self, tools: &dyn ToolInvoker) -> Vec<CompensationOutcome> {
        let mut outcomes = Vec::new();
        // Re-read the stack each round; never hold the lock across an await.
        while let Some(compensation) = self.pop() {
            warn!(action = %compensation, "running compensation");
            match compensation.run(tools).await {
                Ok(()) => outcomes.push(CompensationOutcome::Completed(compensation)),
                Err(e) => {
                    error!(action = %compensation, error = %e, "compensation failed, manual cleanup required");
                    outcomes.push(CompensationOutcome::Failed {
                        compensation,
                        error: e.to_string(),
                    });
                }
            }
        }
        outcomes
    }
}
