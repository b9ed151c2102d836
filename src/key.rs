//! Instance identity (spec §4.A).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// `(hostname, port)` identity of a probed server.
///
/// Equality is structural: the hostname stored here is expected to already
/// be in canonical form (the [`crate::resolver::HostnameResolver`] is
/// responsible for canonicalising before an `InstanceKey` is constructed
/// for storage or comparison — see invariant 6 in spec §3).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct InstanceKey {
    pub hostname: String,
    pub port: u16,
}

impl InstanceKey {
    #[must_use]
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// Parse `(host, port_string)` into an `InstanceKey`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `port_string` does not parse to a
    /// positive `u16`.
    pub fn parse(host: impl Into<String>, port_string: &str) -> Result<Self> {
        let port: u16 = port_string
            .trim()
            .parse()
            .map_err(|_| Error::InvalidInput(format!("invalid port {port_string:?}")))?;
        if port == 0 {
            return Err(Error::InvalidInput("port must be positive".to_string()));
        }
        Ok(Self::new(host, port))
    }

    /// An empty key (used as the default/"not a slave" sentinel for
    /// `MasterKey`).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            hostname: String::new(),
            port: 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hostname.is_empty()
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

impl Default for InstanceKey {
    fn default() -> Self {
        Self::empty()
    }
}
