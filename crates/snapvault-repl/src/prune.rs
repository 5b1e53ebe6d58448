//! Retention: keep the newest `keep_max` snapshots of a series.

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::tools::ToolInvoker;
use crate::zone::ZonePattern;
use std::path::Path;
use tracing::{info, warn};

/// Deletion order for a series: everything past the newest `keep_max`,
/// oldest first. Input may be in any order.
pub fn prune_candidates(mut names: Vec<String>, keep_max: usize) -> Vec<String> {
    // Newest first, then pop from the tail.
    names.sort_by(|a, b| b.cmp(a));
    let mut doomed = Vec::new();
    while names.len() > keep_max {
        match names.pop() {
            Some(oldest) => doomed.push(oldest),
            None => break,
        }
    }
    doomed
}

/// Deletes aged snapshots from a source zone.
pub struct PruneEngine<'a> {
    tools: &'a dyn ToolInvoker,
    cancel: &'a CancelToken,
}

impl<'a> PruneEngine<'a> {
    /// Create a prune engine.
    pub fn new(tools: &'a dyn ToolInvoker, cancel: &'a CancelToken) -> Self {
        Self { tools, cancel }
    }

    /// Prune the series selected by `pattern` down to `keep_max` entries.
    /// Returns the deleted snapshot paths. The first failed delete aborts the
    /// zone; newer snapshots are never touched before older ones are gone.
    pub async fn prune(&self, pattern: &ZonePattern, keep_max: usize) -> Result<Vec<String>> {
        let entries = self.tools.list_zone(&pattern.zone(), self.cancel).await?;
        let series = pattern.select(entries);
        let total = series.len();
        let doomed = prune_candidates(series, keep_max);

        let mut deleted = Vec::with_capacity(doomed.len());
        for path in doomed {
            self.cancel.check()?;
            if let Err(e) = self.tools.delete_snapshot(Path::new(&path), self.cancel).await {
                warn!(zone = %pattern, path = %path, deleted = deleted.len(), "prune aborted");
                return Err(e);
            }
            info!(path = %path, "pruned");
            deleted.push(path);
        }

        info!(zone = %pattern, kept = total - deleted.len(), deleted = deleted.len(), "retention applied");
        Ok(deleted)
    }
}
