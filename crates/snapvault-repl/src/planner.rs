//! Replication planning: which snapshots a destination is missing, and which
//! snapshot both sides already share as the base for the first delta.

use crate::zone::basename;
use serde::Serialize;
use std::collections::HashSet;

/// Transfer plan for one source series against one destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationPlan {
    /// Newest snapshot of the synced prefix, present on both sides.
    pub common_base: Option<String>,
    /// Snapshots to transfer, oldest first.
    pub missing: Vec<String>,
}

impl ReplicationPlan {
    /// Nothing to transfer.
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }

    /// Number of transfers that will be streamed as deltas.
    pub fn incremental_count(&self) -> usize {
        match self.missing.len() {
            0 => 0,
            n if self.common_base.is_some() => n,
            n => n - 1,
        }
    }
}

/// Compute the plan for `source_names` (ascending) against `target_names`.
///
/// A source snapshot is present at the destination when
/// `destination_prefix + basename(name)` is in `target_names`. The common
/// base is the last element of the leading run of present snapshots; once a
/// missing snapshot has been seen, later matches are ignored because the
/// delta chain must be contiguous.
pub fn plan(
    source_names: &[String],
    target_names: &HashSet<String>,
    destination_prefix: &str,
) -> ReplicationPlan {
    let mut result = ReplicationPlan::default();
    for name in source_names {
        let qualified = format!("{}{}", destination_prefix, basename(name));
        if target_names.contains(&qualified) {
            if result.missing.is_empty() {
                result.common_base = Some(name.clone());
            }
        } else {
            result.missing.push(name.clone());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn set(v: &[&str]) -> HashSet<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_source_gives_empty_plan() {
        let p = plan(&[], &set(&["/b/a"]), "/b/");
        assert_eq!(p, ReplicationPlan::default());
        assert!(p.is_empty());
    }

    #[test]
    fn test_empty_target_transfers_everything_full_first() {
        let src = names(&["/s/a", "/s/b", "/s/c"]);
        let p = plan(&src, &HashSet::new(), "/b/");
        assert_eq!(p.common_base, None);
        assert_eq!(p.missing, src);
        assert_eq!(p.incremental_count(), 2);
    }

    #[test]
    fn test_all_present_sets_base_to_last() {
        let src = names(&["/s/a", "/s/b"]);
        let p = plan(&src, &set(&["/b/a", "/b/b"]), "/b/");
        assert_eq!(p.common_base.as_deref(), Some("/s/b"));
        assert!(p.missing.is_empty());
        assert_eq!(p.incremental_count(), 0);
    }

    #[test]
    fn test_daily_example() {
        let src = names(&[
            "/snap/snap-2024-01-01",
            "/snap/snap-2024-01-02",
            "/snap/snap-2024-01-03",
        ]);
        let p = plan(&src, &set(&["/backup/snap-2024-01-01"]), "/backup/");
        assert_eq!(p.common_base.as_deref(), Some("/snap/snap-2024-01-01"));
        assert_eq!(
            p.missing,
            names(&["/snap/snap-2024-01-02", "/snap/snap-2024-01-03"])
        );
        assert_eq!(p.incremental_count(), 2);
    }

    #[test]
    fn test_match_after_gap_is_ignored_as_base() {
        let src = names(&["/s/a", "/s/b", "/s/c", "/s/d"]);
        let p = plan(&src, &set(&["/b/a", "/b/c"]), "/b/");
        assert_eq!(p.common_base.as_deref(), Some("/s/a"));
        assert_eq!(p.missing, names(&["/s/b", "/s/d"]));
    }

    #[test]
    fn test_first_missing_means_no_base_even_with_later_matches() {
        let src = names(&["/s/a", "/s/b", "/s/c"]);
        let p = plan(&src, &set(&["/b/b", "/b/c"]), "/b/");
        assert_eq!(p.common_base, None);
        assert_eq!(p.missing, names(&["/s/a"]));
    }

    #[test]
    fn test_prefix_is_applied_to_basename_only() {
        let src = names(&["/very/deep/source/x"]);
        let p = plan(&src, &set(&["host:/x"]), "host:/");
        assert_eq!(p.common_base.as_deref(), Some("/very/deep/source/x"));
    }
}
