//! Typed error taxonomy for the topology core (spec §7).
//!
//! Each variant corresponds to one of the error kinds the spec names, so
//! callers can match on *kind* rather than parse a message. `anyhow` stays
//! at the CLI boundary (`cli/`); everything under the library core returns
//! `Result<T, Error>`.

use crate::key::InstanceKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Could not open a connection to a live server or the backend store.
    #[error("connection failed for {key}: {source}")]
    ConnectionFailed {
        key: InstanceKey,
        #[source]
        source: sqlx::Error,
    },

    /// A statement failed mid-probe or mid-control-operation.
    #[error("query failed for {key}: {source}")]
    QueryFailed {
        key: InstanceKey,
        #[source]
        source: sqlx::Error,
    },

    /// A stated precondition for a control operation was not met.
    #[error("precondition failed for {key}: {reason}")]
    PreconditionFailed { key: InstanceKey, reason: String },

    /// A bounded operation (`StopSlaveNicely`, ...) exceeded its timeout.
    #[error("operation on {key} timed out after {elapsed_ms}ms")]
    Timeout { key: InstanceKey, elapsed_ms: u64 },

    /// `StartSlaveUntilMasterCoordinates` observed the SQL thread past the
    /// target coordinates.
    #[error(
        "sql thread on {key} overshot target {target}: observed {observed}"
    )]
    Overshoot {
        key: InstanceKey,
        target: crate::coordinates::BinlogCoordinates,
        observed: crate::coordinates::BinlogCoordinates,
    },

    /// Malformed key, unparseable port, or an unsafe search/condition
    /// string.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
