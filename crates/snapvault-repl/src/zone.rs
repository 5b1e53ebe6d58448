//! Snapshot zones: directories holding an ordered series of snapshots.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// A remote host reached over ssh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHost {
    /// Host name or address.
    pub host: String,
    /// Login user.
    pub user: String,
    /// Identity file handed to ssh.
    pub identity: PathBuf,
    /// Optional ssh port.
    pub port: Option<u16>,
}

impl RemoteHost {
    /// The `user@host` argument for ssh.
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// A directory of snapshots, local or on a remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Zone {
    /// Directory on this host.
    Local {
        /// Zone directory.
        dir: PathBuf,
    },
    /// Directory on a remote host.
    Remote {
        /// How to reach the host.
        host: RemoteHost,
        /// Zone directory on that host.
        dir: PathBuf,
    },
}

impl Zone {
    /// Local zone at `dir`.
    pub fn local(dir: impl Into<PathBuf>) -> Self {
        Zone::Local { dir: dir.into() }
    }

    /// The zone directory.
    pub fn dir(&self) -> &Path {
        match self {
            Zone::Local { dir } | Zone::Remote { dir, .. } => dir,
        }
    }

    /// Prefix that turns a snapshot name into its identifier in this zone.
    pub fn prefix(&self) -> String {
        dir_prefix(self.dir())
    }

    /// Identifier of `name` inside this zone.
    pub fn qualify(&self, name: &str) -> String {
        format!("{}{}", self.prefix(), name)
    }

    /// True for zones reached over ssh.
    pub fn is_remote(&self) -> bool {
        matches!(self, Zone::Remote { .. })
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::Local { dir } => write!(f, "{}", dir.display()),
            Zone::Remote { host, dir } => write!(f, "{}:{}", host.login(), dir.display()),
        }
    }
}

/// The series of snapshots produced by one naming template inside a directory.
#[derive(Debug, Clone)]
pub struct ZonePattern {
    dir: PathBuf,
    names: Regex,
}

impl ZonePattern {
    /// Create a pattern. `names` must match a whole entry name; callers anchor it.
    pub fn new(dir: impl Into<PathBuf>, names: Regex) -> Self {
        Self {
            dir: dir.into(),
            names,
        }
    }

    /// Directory holding the series.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The name pattern.
    pub fn name_regex(&self) -> &str {
        self.names.as_str()
    }

    /// Local zone view of the directory.
    pub fn zone(&self) -> Zone {
        Zone::local(self.dir.clone())
    }

    /// Whether `name` belongs to this series.
    pub fn matches(&self, name: &str) -> bool {
        self.names.is_match(name)
    }

    /// Filter directory entries to this series, ascending by name, as full paths.
    pub fn select<I>(&self, entries: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        let mut names: Vec<String> = entries.into_iter().filter(|n| self.matches(n)).collect();
        names.sort();
        let prefix = dir_prefix(&self.dir);
        names.into_iter().map(|n| format!("{}{}", prefix, n)).collect()
    }
}

impl PartialEq for ZonePattern {
    fn eq(&self, other: &Self) -> bool {
        self.dir == other.dir && self.names.as_str() == other.names.as_str()
    }
}

impl fmt::Display for ZonePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dir.display(), self.names.as_str())
    }
}

/// Final path component of a snapshot identifier.
pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

fn dir_prefix(dir: &Path) -> String {
    let s = dir.to_string_lossy();
    if s.ends_with('/') {
        s.into_owned()
    } else {
        format!("{}/", s)
    }
}
