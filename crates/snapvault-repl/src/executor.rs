//! The fixed snapshot → backup → remote backup → prune pipeline.

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::jobs::{JobSet, PruneJob, SnapshotJob};
use crate::planner::{self, ReplicationPlan};
use crate::prune::{prune_candidates, PruneEngine};
use crate::recovery::CompensationStack;
use crate::tools::ToolInvoker;
use crate::transfer::TransferExecutor;
use crate::zone::{Zone, ZonePattern};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tracing::{error, info, warn};

/// Pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Snapshot creation.
    Snapshot,
    /// Replication into local zones.
    Backup,
    /// Replication to remote zones.
    RemoteBackup,
    /// Retention.
    Prune,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Snapshot => write!(f, "snapshot"),
            Phase::Backup => write!(f, "backup"),
            Phase::RemoteBackup => write!(f, "remote-backup"),
            Phase::Prune => write!(f, "prune"),
        }
    }
}

/// Knobs for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Plan and log only; create, transfer and delete nothing.
    pub dry_run: bool,
}

/// Plan for one replication job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedTransfer {
    /// Source series.
    pub source: String,
    /// Destination zone.
    pub target: String,
    /// The computed plan.
    pub plan: ReplicationPlan,
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Snapshots created.
    pub created: Vec<String>,
    /// Snapshots that already existed.
    pub skipped: Vec<String>,
    /// Snapshots transferred, all destinations.
    pub transferred: Vec<String>,
    /// Transfers streamed as deltas.
    pub incremental: usize,
    /// Snapshots deleted by retention.
    pub pruned: Vec<String>,
}

/// Runs a [`JobSet`] phase by phase.
pub struct JobExecutor<'a> {
    tools: &'a dyn ToolInvoker,
    compensations: CompensationStack,
    cancel: CancelToken,
    options: ExecutorOptions,
}

impl<'a> JobExecutor<'a> {
    /// Create an executor.
    pub fn new(
        tools: &'a dyn ToolInvoker,
        compensations: CompensationStack,
        cancel: CancelToken,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            tools,
            compensations,
            cancel,
            options,
        }
    }

    /// Run every phase. On the first failure the pending compensations are
    /// executed and the error is returned; no later job runs.
    pub async fn run(&self, jobs: &JobSet) -> Result<RunSummary> {
        match self.run_phases(jobs).await {
            Ok(summary) => {
                info!(
                    created = summary.created.len(),
                    skipped = summary.skipped.len(),
                    transferred = summary.transferred.len(),
                    incremental = summary.incremental,
                    pruned = summary.pruned.len(),
                    "run complete"
                );
                Ok(summary)
            }
            Err(e) => {
                error!(error = %e, "run failed");
                let outcomes = self.compensations.run_all_armed(self.tools).await;
                if outcomes.iter().any(|o| !o.is_completed()) {
                    error!("rollback incomplete, destination may hold a partial snapshot");
                }
                Err(e)
            }
        }
    }

    async fn run_phases(&self, jobs: &JobSet) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        self.enter(Phase::Snapshot, jobs.snapshots.len());
        for job in &jobs.snapshots {
            self.snapshot(job, &mut summary).await?;
        }

        self.enter(Phase::Backup, jobs.backups.len());
        for job in &jobs.backups {
            self.replicate(&job.source, &job.target(), &mut summary).await?;
        }

        self.enter(Phase::RemoteBackup, jobs.remote_backups.len());
        for job in &jobs.remote_backups {
            self.replicate(&job.source, &job.target(), &mut summary).await?;
        }

        self.enter(Phase::Prune, jobs.prunes.len());
        for job in &jobs.prunes {
            self.prune(job, &mut summary).await?;
        }

        Ok(summary)
    }

    fn enter(&self, phase: Phase, jobs: usize) {
        info!(%phase, jobs, dry_run = self.options.dry_run, "phase");
    }

    async fn snapshot(&self, job: &SnapshotJob, summary: &mut RunSummary) -> Result<()> {
        self.cancel.check()?;
        let dest = job.destination.display().to_string();
        if self.tools.exists(&job.destination).await {
            info!(snapshot = %dest, "snapshot exists, skipping");
            summary.skipped.push(dest);
            return Ok(());
        }
        if self.options.dry_run {
            info!(volume = %job.volume.display(), snapshot = %dest, "would create snapshot");
            return Ok(());
        }
        self.tools
            .create_snapshot(&job.volume, &job.destination, &self.cancel)
            .await?;
        info!(volume = %job.volume.display(), snapshot = %dest, "snapshot created");
        summary.created.push(dest);
        Ok(())
    }

    /// Plan replication of `source` into `target` from the live inventories.
    pub async fn plan_for(&self, source: &ZonePattern, target: &Zone) -> Result<ReplicationPlan> {
        let entries = self.tools.list_zone(&source.zone(), &self.cancel).await?;
        let sources = source.select(entries);
        let targets: HashSet<String> = self
            .tools
            .list_zone(target, &self.cancel)
            .await?
            .iter()
            .map(|name| target.qualify(name))
            .collect();
        Ok(planner::plan(&sources, &targets, &target.prefix()))
    }

    /// Plans for every local and remote backup job, without transferring.
    pub async fn plans(&self, jobs: &JobSet) -> Result<Vec<PlannedTransfer>> {
        let local = jobs.backups.iter().map(|j| (&j.source, j.target()));
        let remote = jobs.remote_backups.iter().map(|j| (&j.source, j.target()));
        let mut planned = Vec::new();
        for (source, target) in local.chain(remote) {
            let plan = self.plan_for(source, &target).await?;
            planned.push(PlannedTransfer {
                source: source.to_string(),
                target: target.to_string(),
                plan,
            });
        }
        Ok(planned)
    }

    async fn replicate(&self, source: &ZonePattern, target: &Zone, summary: &mut RunSummary) -> Result<()> {
        let plan = self.plan_for(source, target).await?;
        info!(
            source = %source,
            target = %target,
            base = plan.common_base.as_deref().unwrap_or("-"),
            missing = plan.missing.len(),
            "planned"
        );
        if plan.is_empty() {
            return Ok(());
        }
        if plan.common_base.is_none() {
            warn!(target = %target, "no common snapshot, first transfer is a full stream");
        }
        if self.options.dry_run {
            for name in &plan.missing {
                info!(snapshot = %name, target = %target, "would transfer");
            }
            return Ok(());
        }

        let report = TransferExecutor::new(self.tools, &self.compensations, &self.cancel)
            .execute(&plan, target)
            .await?;
        summary.incremental += report.incremental;
        summary.transferred.extend(report.transferred);
        Ok(())
    }

    async fn prune(&self, job: &PruneJob, summary: &mut RunSummary) -> Result<()> {
        if self.options.dry_run {
            let entries = self.tools.list_zone(&job.pattern.zone(), &self.cancel).await?;
            for name in prune_candidates(job.pattern.select(entries), job.keep_max) {
                info!(snapshot = %name, "would prune");
            }
            return Ok(());
        }
        let deleted = PruneEngine::new(self.tools, &self.cancel)
            .prune(&job.pattern, job.keep_max)
            .await?;
        summary.pruned.extend(deleted);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::new_cancel_pair;
    use crate::error::VaultError;
    use crate::jobs::BackupJob;
    use crate::tools::SendRequest;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use regex::Regex;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};

    /// In-memory zones keyed by directory, with an operation log.
    #[derive(Default)]
    struct MemTools {
        zones: Mutex<BTreeMap<PathBuf, Vec<String>>>,
        log: Mutex<Vec<String>>,
        fail_transfer_of: Option<String>,
        stall_transfer_of: Option<String>,
    }

    impl MemTools {
        fn zone(&self, dir: &str, names: &[&str]) {
            self.zones
                .lock()
                .insert(dir.into(), names.iter().map(|s| s.to_string()).collect());
        }

        fn names(&self, dir: &str) -> Vec<String> {
            let mut v = self.zones.lock().get(Path::new(dir)).cloned().unwrap_or_default();
            v.sort();
            v
        }

        fn add(&self, path: &Path) {
            let dir = path.parent().unwrap().to_path_buf();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            self.zones.lock().entry(dir).or_default().push(name);
        }
    }

    #[async_trait]
    impl ToolInvoker for MemTools {
        async fn create_snapshot(&self, volume: &Path, dest: &Path, _: &CancelToken) -> Result<()> {
            self.log
                .lock()
                .push(format!("create {} {}", volume.display(), dest.display()));
            self.add(dest);
            Ok(())
        }

        async fn delete_snapshot(&self, path: &Path, _: &CancelToken) -> Result<()> {
            self.log.lock().push(format!("delete {}", path.display()));
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            if let Some(v) = self.zones.lock().get_mut(path.parent().unwrap()) {
                v.retain(|n| *n != name);
            }
            Ok(())
        }

        async fn exists(&self, path: &Path) -> bool {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            self.zones
                .lock()
                .get(path.parent().unwrap())
                .map(|v| v.contains(&name))
                .unwrap_or(false)
        }

        async fn list_zone(&self, zone: &Zone, _: &CancelToken) -> Result<Vec<String>> {
            self.zones
                .lock()
                .get(zone.dir())
                .cloned()
                .ok_or_else(|| VaultError::transfer("list", format!("no such zone {}", zone)))
        }

        async fn transfer(&self, send: &SendRequest, target: &Zone, cancel: &CancelToken) -> Result<()> {
            let name = send.snapshot.file_name().unwrap().to_string_lossy().into_owned();
            self.log.lock().push(format!(
                "send {}{} -> {}",
                send.snapshot.display(),
                send.parent
                    .as_ref()
                    .map(|p| format!(" -p {}", p.display()))
                    .unwrap_or_default(),
                target
            ));
            // The receiver has already created the subvolume when it fails.
            self.add(&target.dir().join(&name));
            if self.fail_transfer_of.as_deref() == Some(name.as_str()) {
                return Err(VaultError::transfer("receive", "exit status: 1"));
            }
            if self.stall_transfer_of.as_deref() == Some(name.as_str()) {
                let reason = cancel.cancelled().await;
                return Err(VaultError::Interrupted {
                    reason: reason.to_string(),
                });
            }
            Ok(())
        }
    }

    fn series() -> ZonePattern {
        ZonePattern::new("/snap", Regex::new(r"^snap-.*$").unwrap())
    }

    fn jobs_with_backup() -> JobSet {
        JobSet {
            snapshots: vec![SnapshotJob {
                volume: "/home".into(),
                destination: "/snap/snap-2024-01-03".into(),
            }],
            backups: vec![BackupJob {
                source: series(),
                target_dir: "/backup".into(),
            }],
            remote_backups: vec![],
            prunes: vec![PruneJob {
                pattern: series(),
                keep_max: 2,
            }],
        }
    }

    fn executor<'a>(tools: &'a MemTools, stack: &CompensationStack, dry_run: bool) -> JobExecutor<'a> {
        let (token, _handle) = new_cancel_pair();
        JobExecutor::new(tools, stack.clone(), token, ExecutorOptions { dry_run })
    }

    #[tokio::test]
    async fn test_phases_run_in_order() {
        let tools = MemTools::default();
        tools.zone("/snap", &["snap-2024-01-01", "snap-2024-01-02"]);
        tools.zone("/backup", &["snap-2024-01-01"]);
        let stack = CompensationStack::new();

        let summary = executor(&tools, &stack, false)
            .run(&jobs_with_backup())
            .await
            .unwrap();

        assert_eq!(
            *tools.log.lock(),
            vec![
                "create /home /snap/snap-2024-01-03",
                "send /snap/snap-2024-01-02 -p /snap/snap-2024-01-01 -> /backup",
                "send /snap/snap-2024-01-03 -p /snap/snap-2024-01-02 -> /backup",
                "delete /snap/snap-2024-01-01",
            ]
        );
        assert_eq!(summary.created, vec!["/snap/snap-2024-01-03"]);
        assert_eq!(summary.incremental, 2);
        assert_eq!(summary.pruned, vec!["/snap/snap-2024-01-01"]);
        assert_eq!(
            tools.names("/backup"),
            vec!["snap-2024-01-01", "snap-2024-01-02", "snap-2024-01-03"]
        );
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let tools = MemTools::default();
        tools.zone("/snap", &["snap-2024-01-02", "snap-2024-01-03"]);
        tools.zone("/backup", &["snap-2024-01-02", "snap-2024-01-03"]);
        let stack = CompensationStack::new();

        let summary = executor(&tools, &stack, false)
            .run(&jobs_with_backup())
            .await
            .unwrap();

        assert_eq!(summary.skipped, vec!["/snap/snap-2024-01-03"]);
        assert!(summary.transferred.is_empty());
        assert!(tools.log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_transfer_rolls_back_and_stops() {
        let tools = MemTools {
            fail_transfer_of: Some("s3".to_string()),
            ..Default::default()
        };
        tools.zone("/snap", &["s1", "s2", "s3", "s4", "s5"]);
        tools.zone("/backup", &[]);
        let jobs = JobSet {
            backups: vec![BackupJob {
                source: ZonePattern::new("/snap", Regex::new(r"^s\d$").unwrap()),
                target_dir: "/backup".into(),
            }],
            prunes: vec![PruneJob {
                pattern: ZonePattern::new("/snap", Regex::new(r"^s\d$").unwrap()),
                keep_max: 0,
            }],
            ..Default::default()
        };
        let stack = CompensationStack::new();

        let err = executor(&tools, &stack, false).run(&jobs).await.unwrap_err();

        assert!(matches!(err, VaultError::Transfer { .. }));
        let log = tools.log.lock().clone();
        let deletes: Vec<_> = log.iter().filter(|l| l.starts_with("delete")).collect();
        assert_eq!(deletes, vec!["delete /backup/s3"]);
        assert_eq!(log.iter().filter(|l| l.starts_with("send")).count(), 3);
        assert_eq!(tools.names("/backup"), vec!["s1", "s2"]);
        assert_eq!(tools.names("/snap").len(), 5);
        assert!(!stack.is_armed());
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let tools = MemTools::default();
        tools.zone("/snap", &["snap-2024-01-01", "snap-2024-01-02", "snap-2024-01-03"]);
        tools.zone("/backup", &[]);
        let stack = CompensationStack::new();

        let summary = executor(&tools, &stack, true)
            .run(&jobs_with_backup())
            .await
            .unwrap();

        assert_eq!(summary.skipped, vec!["/snap/snap-2024-01-03"]);
        assert!(summary.created.is_empty());
        assert!(tools.log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_plans_report_without_transfer() {
        let tools = MemTools::default();
        tools.zone("/snap", &["snap-2024-01-01", "snap-2024-01-02"]);
        tools.zone("/backup", &["snap-2024-01-01"]);
        let stack = CompensationStack::new();

        let plans = executor(&tools, &stack, false)
            .plans(&jobs_with_backup())
            .await
            .unwrap();

        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].target, "/backup");
        assert_eq!(
            plans[0].plan.common_base.as_deref(),
            Some("/snap/snap-2024-01-01")
        );
        assert_eq!(plans[0].plan.missing, vec!["/snap/snap-2024-01-02"]);
        assert!(tools.log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_executes_nothing() {
        let tools = MemTools::default();
        tools.zone("/snap", &[]);
        let stack = CompensationStack::new();
        let (token, handle) = new_cancel_pair();
        handle.cancel(crate::cancel::CancelReason::Terminate);
        let exec = JobExecutor::new(&tools, stack, token, ExecutorOptions::default());

        let err = exec.run(&jobs_with_backup()).await.unwrap_err();
        assert!(err.is_interrupted());
        assert!(tools.log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_during_transfer_rolls_back_partial() {
        let tools = MemTools {
            stall_transfer_of: Some("s3".to_string()),
            ..Default::default()
        };
        tools.zone("/snap", &["s1", "s2", "s3", "s4", "s5"]);
        tools.zone("/backup", &[]);
        let series = ZonePattern::new("/snap", Regex::new(r"^s\d$").unwrap());
        let jobs = JobSet {
            backups: vec![BackupJob {
                source: series.clone(),
                target_dir: "/backup".into(),
            }],
            prunes: vec![PruneJob {
                pattern: series,
                keep_max: 0,
            }],
            ..Default::default()
        };
        let stack = CompensationStack::new();
        let (token, handle) = new_cancel_pair();
        let exec = JobExecutor::new(&tools, stack.clone(), token, ExecutorOptions::default());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            handle.cancel(crate::cancel::CancelReason::Interrupt);
        });

        let err = exec.run(&jobs).await.unwrap_err();
        canceller.await.unwrap();

        assert!(err.is_interrupted());
        assert_eq!(err.exit_code(), 130);
        let log = tools.log.lock().clone();
        let deletes: Vec<_> = log.iter().filter(|l| l.starts_with("delete")).collect();
        assert_eq!(deletes, vec!["delete /backup/s3"]);
        assert_eq!(log.iter().filter(|l| l.starts_with("send")).count(), 3);
        assert_eq!(tools.names("/backup"), vec!["s1", "s2"]);
        assert_eq!(tools.names("/snap").len(), 5);
        assert!(!stack.is_armed());
    }
}
