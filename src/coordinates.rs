//! Binlog coordinate ordering (spec §4.A).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Which log stream a [`BinlogCoordinates`] refers to.
///
/// `Binary` coordinates come from `SHOW MASTER STATUS`/the IO and SQL
/// thread positions in `SHOW SLAVE STATUS`; `Relay` coordinates come from
/// the relay log position. Two coordinates are only comparable when their
/// `LogType` matches (spec §3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum LogType {
    Binary,
    Relay,
}

/// `(logFile, logPos, type)` — a position inside a replication log stream.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BinlogCoordinates {
    pub log_file: String,
    pub log_pos: i64,
    pub log_type: LogType,
}

impl BinlogCoordinates {
    #[must_use]
    pub fn new(log_file: impl Into<String>, log_pos: i64, log_type: LogType) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
            log_type,
        }
    }

    #[must_use]
    pub fn empty(log_type: LogType) -> Self {
        Self::new(String::new(), 0, log_type)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log_file.is_empty()
    }

    /// Structural equality, per spec: same file, same position, same type.
    #[must_use]
    pub fn equals(&self, other: &Self) -> bool {
        self == other
    }

    /// Total order: compare `log_file` lexicographically, then `log_pos`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `self` and `other` have differing
    /// `log_type`s — they are not comparable.
    pub fn smaller_than(&self, other: &Self) -> Result<bool> {
        Ok(self.compare(other)? == Ordering::Less)
    }

    /// As [`Self::smaller_than`], but returns the raw ordering.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] on a `log_type` mismatch.
    pub fn compare(&self, other: &Self) -> Result<Ordering> {
        if self.log_type != other.log_type {
            return Err(Error::InvalidInput(format!(
                "cannot compare coordinates of differing type ({:?} vs {:?})",
                self.log_type, other.log_type
            )));
        }
        Ok(self
            .log_file
            .cmp(&other.log_file)
            .then(self.log_pos.cmp(&other.log_pos)))
    }
}

impl fmt::Display for BinlogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_pos)
    }
}
