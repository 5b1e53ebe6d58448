//! Execution of a replication plan as a chain of send/receive pipes.

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::planner::ReplicationPlan;
use crate::recovery::{Compensation, CompensationStack};
use crate::tools::{SendRequest, ToolInvoker};
use crate::zone::{basename, Zone};
use std::time::Instant;
use tracing::{debug, info};

/// What a completed plan execution did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Snapshots committed at the destination, in transfer order.
    pub transferred: Vec<String>,
    /// How many of them were streamed as deltas.
    pub incremental: usize,
}

/// Streams the missing snapshots of a plan into a destination zone.
///
/// Each snapshot after the first is sent relative to the one before it, so
/// the destination always receives an unbroken chain. A compensation for
/// the snapshot in flight is armed for exactly the duration of its pipe.
pub struct TransferExecutor<'a> {
    tools: &'a dyn ToolInvoker,
    compensations: &'a CompensationStack,
    cancel: &'a CancelToken,
}

impl<'a> TransferExecutor<'a> {
    /// Create an executor.
    pub fn new(
        tools: &'a dyn ToolInvoker,
        compensations: &'a CompensationStack,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            tools,
            compensations,
            cancel,
        }
    }

    /// Execute `plan` against `target`. Stops at the first failure, leaving
    /// that snapshot's compensation armed for the caller to run.
    pub async fn execute(&self, plan: &ReplicationPlan, target: &Zone) -> Result<TransferReport> {
        let mut report = TransferReport::default();
        let mut base = plan.common_base.clone();

        for snapshot in &plan.missing {
            self.cancel.check()?;

            let send = match &base {
                Some(parent) => SendRequest::incremental(snapshot, parent),
                None => SendRequest::full(snapshot),
            };
            let name = basename(snapshot);
            info!(
                snapshot = %snapshot,
                parent = base.as_deref().unwrap_or("-"),
                target = %target,
                "transferring"
            );

            self.compensations
                .push(Compensation::for_partial_receive(target, name));
            let started = Instant::now();
            self.tools.transfer(&send, target, self.cancel).await?;
            self.compensations.pop();
            debug!(snapshot = %snapshot, elapsed_ms = started.elapsed().as_millis() as u64, "committed");

            if send.is_incremental() {
                report.incremental += 1;
            }
            report.transferred.push(snapshot.clone());
            base = Some(snapshot.clone());
        }

        Ok(report)
    }
}
