//! Job declarations after template resolution.

use crate::zone::{RemoteHost, Zone, ZonePattern};
use std::path::PathBuf;

/// Create a read-only snapshot of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotJob {
    /// Volume to snapshot.
    pub volume: PathBuf,
    /// Resolved snapshot path.
    pub destination: PathBuf,
}

/// Replicate a snapshot series into a local directory.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupJob {
    /// Source series.
    pub source: ZonePattern,
    /// Destination directory.
    pub target_dir: PathBuf,
}

impl BackupJob {
    /// Destination zone.
    pub fn target(&self) -> Zone {
        Zone::local(self.target_dir.clone())
    }
}

/// Replicate a snapshot series to a directory on a remote host.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteBackupJob {
    /// Source series.
    pub source: ZonePattern,
    /// Remote host and credentials.
    pub remote: RemoteHost,
    /// Destination directory on the remote host.
    pub target_dir: PathBuf,
}

impl RemoteBackupJob {
    /// Destination zone.
    pub fn target(&self) -> Zone {
        Zone::Remote {
            host: self.remote.clone(),
            dir: self.target_dir.clone(),
        }
    }
}

/// Trim a snapshot series to its newest `keep_max` entries.
#[derive(Debug, Clone, PartialEq)]
pub struct PruneJob {
    /// Series to trim.
    pub pattern: ZonePattern,
    /// Number of snapshots to keep.
    pub keep_max: usize,
}

/// All jobs of one run, grouped by phase. Built once, read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSet {
    /// Phase 1.
    pub snapshots: Vec<SnapshotJob>,
    /// Phase 2.
    pub backups: Vec<BackupJob>,
    /// Phase 3.
    pub remote_backups: Vec<RemoteBackupJob>,
    /// Phase 4.
    pub prunes: Vec<PruneJob>,
}

impl JobSet {
    /// Total number of jobs.
    pub fn len(&self) -> usize {
        self.snapshots.len() + self.backups.len() + self.remote_backups.len() + self.prunes.len()
    }

    /// True when there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any job needs ssh.
    pub fn needs_remote(&self) -> bool {
        !self.remote_backups.is_empty()
    }

    /// Append another set, keeping phase grouping.
    pub fn extend(&mut self, other: JobSet) {
        self.snapshots.extend(other.snapshots);
        self.backups.extend(other.backups);
        self.remote_backups.extend(other.remote_backups);
        self.prunes.extend(other.prunes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn pattern() -> ZonePattern {
        ZonePattern::new("/snap", Regex::new("^home\\..*$").unwrap())
    }

    #[test]
    fn test_empty_job_set() {
        let jobs = JobSet::default();
        assert!(jobs.is_empty());
        assert!(!jobs.needs_remote());
    }

    #[test]
    fn test_extend_keeps_phases() {
        let mut jobs = JobSet::default();
        jobs.snapshots.push(SnapshotJob {
            volume: "/home".into(),
            destination: "/snap/home.1".into(),
        });
        let mut other = JobSet::default();
        other.prunes.push(PruneJob {
            pattern: pattern(),
            keep_max: 3,
        });
        other.remote_backups.push(RemoteBackupJob {
            source: pattern(),
            remote: RemoteHost {
                host: "h".into(),
                user: "u".into(),
                identity: "/k".into(),
                port: None,
            },
            target_dir: "/srv".into(),
        });
        jobs.extend(other);
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs.snapshots.len(), 1);
        assert_eq!(jobs.prunes.len(), 1);
        assert!(jobs.needs_remote());
        assert!(jobs.remote_backups[0].target().is_remote());
    }

    #[test]
    fn test_backup_target_is_local() {
        let job = BackupJob {
            source: pattern(),
            target_dir: "/mnt/b".into(),
        };
        assert_eq!(job.target(), Zone::local("/mnt/b"));
    }
}
