//! Canned condition helpers for `ReadByCondition` (spec §4.D).

use crate::error::{Error, Result};
use crate::key::InstanceKey;

/// Default replication-lag threshold (seconds) above which an instance is
/// flagged by [`Condition::Problem`] (spec §4.D: "lag>10s").
pub const PROBLEM_LAG_THRESHOLD_SECONDS: i64 = 10;

/// A canned, pre-validated read condition. Backends translate these into
/// whatever query language they speak; the crate never exposes raw SQL
/// fragments to callers (spec Non-goals: no general-purpose SQL layer).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Condition {
    /// All instances whose `cluster_name` matches.
    ByCluster(String),
    /// All instances whose `master_key` matches.
    ByMaster(InstanceKey),
    /// `last_seen < last_checked` — the instance has never completed a
    /// successful probe since its last attempt.
    Unseen,
    /// Unseen, or stale, or either replication thread down, or lagging
    /// past [`PROBLEM_LAG_THRESHOLD_SECONDS`].
    Problem { poll_interval_seconds: i64 },
    /// Case-insensitive substring match across identity fields (hostname,
    /// cluster name).
    Search(String),
    /// Regex match against hostname.
    HostnameRegex(String),
    /// Every row — used by the sweeper and fleet refresh passes.
    All,
}

impl Condition {
    /// Build a [`Condition::ByCluster`], rejecting single quotes the way
    /// the spec requires ("single quotes in `clusterName` reject with
    /// `InvalidInput`" — guards against naive string-interpolated backends).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `cluster_name` contains a `'`.
    pub fn by_cluster(cluster_name: impl Into<String>) -> Result<Self> {
        let cluster_name = cluster_name.into();
        reject_quotes(&cluster_name)?;
        Ok(Self::ByCluster(cluster_name))
    }

    /// Build a [`Condition::Search`], with the same quoting rule as
    /// [`Condition::by_cluster`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `term` contains a `'`.
    pub fn search(term: impl Into<String>) -> Result<Self> {
        let term = term.into();
        reject_quotes(&term)?;
        Ok(Self::Search(term))
    }

    /// Build a [`Condition::HostnameRegex`], validating the pattern
    /// compiles.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `pattern` is not a valid regex.
    pub fn hostname_regex(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        regex::Regex::new(&pattern)
            .map_err(|e| Error::InvalidInput(format!("invalid hostname regex: {e}")))?;
        Ok(Self::HostnameRegex(pattern))
    }
}

fn reject_quotes(value: &str) -> Result<()> {
    if value.contains('\'') {
        return Err(Error::InvalidInput(
            "quoted identifiers are not permitted in condition strings".to_string(),
        ));
    }
    Ok(())
}
