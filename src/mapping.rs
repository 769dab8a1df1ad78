use std::collections::BTreeMap;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One configured forwarding rule, as recorded by the mapping store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub external_port: u16,

    #[serde(alias = "target_server")]
    pub target_host: String,

    pub target_port: u16,

    #[serde(alias = "is_active", default = "active_by_default")]
    pub active: bool,

    #[serde(default)]
    pub description: String,
}

fn active_by_default() -> bool {
    true
}

impl Mapping {
    pub fn new(external_port: u16, target: Target) -> Self {
        Self {
            external_port,
            target_host: target.host,
            target_port: target.port,
            active: true,
            description: String::new(),
        }
    }

    pub fn target(&self) -> Target {
        Target {
            host: self.target_host.clone(),
            port: self.target_port,
        }
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{}:{}",
            self.external_port, self.target_host, self.target_port
        )
    }
}

/// Upstream `host:port` a mapping forwards to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseTargetError {
    #[error("missing ':' separator")]
    MissingSeparator,

    #[error("missing host")]
    MissingHost,

    #[error("{0}")]
    InvalidPort(ParseIntError),

    #[error("port 0 is not allowed")]
    ZeroPort,
}

impl FromStr for Target {
    type Err = ParseTargetError;

    // Syntax: <host>:<port> | [<ipv6>]:<port>
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use ParseTargetError::*;

        let (host, port) = s.rsplit_once(':').ok_or(MissingSeparator)?;

        let host = host
            .strip_prefix('[')
            .and_then(|x| x.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() {
            return Err(MissingHost);
        }

        let port: u16 = port.parse().map_err(InvalidPort)?;
        if port == 0 {
            return Err(ZeroPort);
        }

        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}

/// The set of mappings that should be live, keyed by external port.
pub type Snapshot = BTreeMap<u16, Mapping>;

/// Normalise a store listing into a [`Snapshot`].
///
/// Inactive and invalid entries are dropped. When more than one enabled
/// entry claims the same external port, the first one wins.
pub fn snapshot<I>(mappings: I) -> Snapshot
where
    I: IntoIterator<Item = Mapping>,
{
    let mut out = Snapshot::new();

    for mapping in mappings {
        if !mapping.active {
            continue;
        }

        if mapping.external_port == 0 || mapping.target_port == 0 {
            warn!("ignoring mapping {mapping} with port 0");
            continue;
        }

        if mapping.target_host.trim().is_empty() {
            warn!("ignoring mapping for port {} without a target host", mapping.external_port);
            continue;
        }

        match out.get(&mapping.external_port) {
            Some(existing) => {
                warn!("port {} is already mapped by {existing}, ignoring {mapping}", mapping.external_port);
            }
            None => {
                out.insert(mapping.external_port, mapping);
            }
        }
    }

    out
}
