use crate::naming::{expand_env, require_absolute, SnapshotTemplate};
use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use snapvault_repl::{
    BackupJob, JobSet, PruneJob, RemoteBackupJob, RemoteHost, Result, SnapshotJob, VaultError,
};
use std::fmt;
use std::path::{Path, PathBuf};

/// Optional overrides for discovered tool locations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolOverrides {
    pub btrfs: Option<PathBuf>,
    pub ssh: Option<PathBuf>,
}

/// One `[[subvolume]]` declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubvolumeDecl {
    pub volume: String,
    pub snapshot: String,
    pub keep: Option<usize>,
    pub backup: Option<String>,
    pub remote_backup: Option<String>,
    pub remote_host: Option<String>,
    pub remote_user: Option<String>,
    pub remote_key: Option<String>,
    pub remote_port: Option<u16>,
}

/// Contents of one job file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobFile {
    #[serde(default)]
    pub tools: ToolOverrides,
    #[serde(default, rename = "subvolume")]
    pub subvolumes: Vec<SubvolumeDecl>,
}

impl JobFile {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| VaultError::config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&contents, &path.display().to_string())
    }

    pub fn parse(contents: &str, origin: &str) -> Result<Self> {
        let file: JobFile = toml::from_str(contents)
            .map_err(|e| VaultError::config(format!("{}: {}", origin, e)))?;
        for (i, decl) in file.subvolumes.iter().enumerate() {
            decl.validate()
                .map_err(|e| VaultError::config(format!("{}: subvolume #{}: {}", origin, i + 1, e)))?;
        }
        Ok(file)
    }
}

/// Why a declaration is inconsistent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclError(String);

impl fmt::Display for DeclError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl SubvolumeDecl {
    /// Structural checks that need no environment.
    pub fn validate(&self) -> std::result::Result<(), DeclError> {
        if self.volume.trim().is_empty() {
            return Err(DeclError("volume must not be empty".into()));
        }
        if self.snapshot.trim().is_empty() {
            return Err(DeclError("snapshot must not be empty".into()));
        }
        let credentials = [&self.remote_host, &self.remote_user, &self.remote_key];
        let given = credentials.iter().filter(|c| c.is_some()).count();
        if given != 0 && given != credentials.len() {
            return Err(DeclError(
                "remote_host, remote_user and remote_key must be given together".into(),
            ));
        }
        if self.remote_backup.is_some() && given == 0 {
            return Err(DeclError(
                "remote_backup requires remote_host, remote_user and remote_key".into(),
            ));
        }
        if self.remote_backup.is_none() && (given != 0 || self.remote_port.is_some()) {
            return Err(DeclError("remote credentials given without remote_backup".into()));
        }
        for (field, value) in [("backup", &self.backup), ("remote_backup", &self.remote_backup)] {
            if value.as_deref().map(|v| v.contains('%')).unwrap_or(false) {
                return Err(DeclError(format!("{} must not contain time tokens", field)));
            }
        }
        Ok(())
    }

    /// Jobs for this declaration, snapshot names resolved at `now`.
    pub fn jobs<Tz, F>(&self, now: &DateTime<Tz>, lookup: F) -> Result<JobSet>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
        F: Fn(&str) -> Option<String>,
    {
        let volume = PathBuf::from(expand_env(&self.volume, &lookup)?);
        require_absolute(&volume, "volume")?;
        let template = SnapshotTemplate::parse(&expand_env(&self.snapshot, &lookup)?)?;
        let pattern = template.pattern();

        let mut jobs = JobSet::default();
        jobs.snapshots.push(SnapshotJob {
            volume,
            destination: template.resolve(now),
        });

        if let Some(backup) = &self.backup {
            let target_dir = PathBuf::from(expand_env(backup, &lookup)?);
            require_absolute(&target_dir, "backup")?;
            if target_dir == template.dir() {
                return Err(VaultError::config(format!(
                    "backup {} is the snapshot directory",
                    target_dir.display()
                )));
            }
            jobs.backups.push(BackupJob {
                source: pattern.clone(),
                target_dir,
            });
        }

        if let (Some(dir), Some(host), Some(user), Some(key)) = (
            &self.remote_backup,
            &self.remote_host,
            &self.remote_user,
            &self.remote_key,
        ) {
            let target_dir = PathBuf::from(expand_env(dir, &lookup)?);
            require_absolute(&target_dir, "remote_backup")?;
            jobs.remote_backups.push(RemoteBackupJob {
                source: pattern.clone(),
                remote: RemoteHost {
                    host: expand_env(host, &lookup)?,
                    user: expand_env(user, &lookup)?,
                    identity: PathBuf::from(expand_env(key, &lookup)?),
                    port: self.remote_port,
                },
                target_dir,
            });
        }

        if let Some(keep_max) = self.keep {
            jobs.prunes.push(PruneJob { pattern, keep_max });
        }

        Ok(jobs)
    }
}

/// Every job file of a run, validated as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VaultConfig {
    pub files: Vec<PathBuf>,
    pub tools: ToolOverrides,
    pub subvolumes: Vec<SubvolumeDecl>,
}

impl VaultConfig {
    /// Load `files` and every `*.toml` in `dir`. Any invalid file fails the
    /// whole load.
    pub fn load(files: &[PathBuf], dir: Option<&Path>) -> Result<Self> {
        let mut paths: Vec<PathBuf> = files.to_vec();
        if let Some(dir) = dir {
            paths.extend(toml_files_in(dir)?);
        }
        if paths.is_empty() {
            return Err(VaultError::config("no job files given"));
        }

        let mut config = VaultConfig::default();
        for path in paths {
            let file = JobFile::from_file(&path)?;
            config.merge_tools(&file.tools, &path)?;
            config.subvolumes.extend(file.subvolumes);
            config.files.push(path);
        }
        Ok(config)
    }

    fn merge_tools(&mut self, tools: &ToolOverrides, origin: &Path) -> Result<()> {
        for (name, current, new) in [
            ("btrfs", &mut self.tools.btrfs, &tools.btrfs),
            ("ssh", &mut self.tools.ssh, &tools.ssh),
        ] {
            match (current.as_ref(), new) {
                (Some(a), Some(b)) if a != b => {
                    return Err(VaultError::config(format!(
                        "{}: tools.{} = {} conflicts with {}",
                        origin.display(),
                        name,
                        b.display(),
                        a.display()
                    )))
                }
                (None, Some(b)) => *current = Some(b.clone()),
                _ => {}
            }
        }
        Ok(())
    }

    /// Build the run's job set with every name resolved at `now`.
    pub fn job_set<Tz, F>(&self, now: &DateTime<Tz>, lookup: F) -> Result<JobSet>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
        F: Fn(&str) -> Option<String>,
    {
        let mut jobs = JobSet::default();
        for decl in &self.subvolumes {
            jobs.extend(decl.jobs(now, &lookup)?);
        }
        let mut seen = std::collections::HashSet::new();
        for job in &jobs.snapshots {
            if !seen.insert(job.destination.clone()) {
                return Err(VaultError::config(format!(
                    "two subvolumes resolve to snapshot {}",
                    job.destination.display()
                )));
            }
        }
        Ok(jobs)
    }
}

fn toml_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| VaultError::config(format!("{}: {}", dir.display(), e)))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("toml") && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}
