#![warn(missing_docs)]

//! snapvault replication subsystem: snapshot transfer planning, streamed send/receive, rollback, retention

pub mod cancel;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod planner;
pub mod prune;
pub mod recovery;
pub mod tools;
pub mod transfer;
pub mod zone;

pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
pub use error::{Result, VaultError};
pub use executor::{ExecutorOptions, JobExecutor, Phase, PlannedTransfer, RunSummary};
pub use jobs::{BackupJob, JobSet, PruneJob, RemoteBackupJob, SnapshotJob};
pub use planner::{plan, ReplicationPlan};
pub use prune::{prune_candidates, PruneEngine};
pub use recovery::{Compensation, CompensationOutcome, CompensationStack};
pub use tools::{ProcessInvoker, SendRequest, ToolInvoker, ToolPaths, GATE_DENIED_STATUS};
pub use transfer::{TransferExecutor, TransferReport};
pub use zone::{RemoteHost, Zone, ZonePattern};
