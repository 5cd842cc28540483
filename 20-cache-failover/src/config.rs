//! Client options and server list parsing.
//!
//! Options deserialize from camelCase keys with durations given in
//! milliseconds, so `{"retries": 0, "minTimeout": 0, "maxTimeout": 100}`
//! is a valid [`ClientConfig`]. Anything not set keeps its default.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Deserializer};

/// Identity of a cache node, always `host:port`.
pub type ServerId = String;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientConfig {
    /// Connect and response timeout, per operation.
    #[serde(deserialize_with = "millis")]
    pub timeout: Duration,
    /// Idle time after which an open socket is closed.
    #[serde(deserialize_with = "millis")]
    pub idle: Duration,
    /// Consecutive failed attempts tolerated before a node can be removed.
    pub retries: u32,
    /// Lock budget: how many lock/unlock cycles a node gets.
    pub failures: u32,
    /// How long a node stays locked after a failure.
    #[serde(deserialize_with = "millis")]
    pub retry: Duration,
    /// Base cooldown before a failed node may be reconnected.
    #[serde(deserialize_with = "millis")]
    pub reconnect: Duration,
    /// Permanently remove a node once `retries` is exhausted.
    pub remove: bool,
    pub redundancy: Redundancy,
    #[serde(deserialize_with = "millis")]
    pub min_timeout: Duration,
    #[serde(deserialize_with = "millis")]
    pub max_timeout: Duration,
    pub factor: f64,
    pub randomize: bool,
    pub max_key_size: usize,
    /// Largest value, in bytes, accepted in a reply.
    pub max_value: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5_000),
            idle: Duration::from_millis(5_000),
            retries: 5,
            failures: 5,
            retry: Duration::from_millis(30_000),
            reconnect: Duration::from_millis(18_000_000),
            remove: false,
            redundancy: Redundancy::Disabled,
            min_timeout: Duration::from_millis(1_000),
            max_timeout: Duration::from_millis(60_000),
            factor: 3.0,
            randomize: false,
            max_key_size: 250,
            max_value: 1_048_576,
        }
    }
}

impl ClientConfig {
    /// Parses options from a JSON object such as `{"retries": 3}`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.timeout.is_zero(), "timeout must be greater than zero");
        ensure!(!self.idle.is_zero(), "idle must be greater than zero");
        ensure!(
            self.factor.is_finite() && self.factor >= 1.0,
            "factor must be a finite number >= 1, got {}",
            self.factor
        );
        ensure!(
            self.min_timeout <= self.max_timeout,
            "minTimeout ({:?}) exceeds maxTimeout ({:?})",
            self.min_timeout,
            self.max_timeout
        );
        ensure!(self.max_key_size > 0, "maxKeySize must be positive");
        ensure!(self.max_value > 0, "maxValue must be positive");
        Ok(())
    }
}

/// How many fallback candidates a lookup yields beyond the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Redundancy {
    #[default]
    Disabled,
    Replicas(usize),
    /// Every other node in the ring is a fallback.
    All,
}

impl Redundancy {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Redundancy::Disabled | Redundancy::Replicas(0))
    }

    pub fn replicas(&self) -> usize {
        match self {
            Redundancy::Disabled => 0,
            Redundancy::Replicas(n) => *n,
            Redundancy::All => usize::MAX,
        }
    }
}

impl<'de> Deserialize<'de> for Redundancy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Flag(bool),
            Count(usize),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Flag(true) => Redundancy::All,
            Repr::Flag(false) | Repr::Count(0) => Redundancy::Disabled,
            Repr::Count(n) => Redundancy::Replicas(n),
        })
    }
}

fn millis<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// One configured node and its share of the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub addr: ServerId,
    pub weight: u32,
}

/// Servers handed to the client: one address, a list, or a weighted map.
#[derive(Debug, Clone, Default)]
pub struct ServerList {
    entries: Vec<(String, u32)>,
}

impl ServerList {
    /// Validates every address and returns the nodes in a stable order.
    pub fn into_specs(self) -> Result<Vec<ServerSpec>> {
        ensure!(!self.entries.is_empty(), "at least one server is required");

        let mut specs: Vec<ServerSpec> = Vec::with_capacity(self.entries.len());
        for (addr, weight) in self.entries {
            let addr = addr.trim().to_string();
            validate_addr(&addr)?;
            ensure!(weight > 0, "server {addr} has zero weight");
            if specs.iter().any(|spec| spec.addr == addr) {
                bail!("server {addr} is listed more than once");
            }
            specs.push(ServerSpec { addr, weight });
        }
        Ok(specs)
    }
}

fn validate_addr(addr: &str) -> Result<()> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        bail!("server address '{addr}' must be host:port");
    };
    ensure!(!host.is_empty(), "server address '{addr}' has an empty host");
    match port.parse::<u16>() {
        Ok(0) | Err(_) => bail!("server address '{addr}' has an invalid port"),
        Ok(_) => Ok(()),
    }
}

impl From<&str> for ServerList {
    fn from(addr: &str) -> Self {
        Self {
            entries: vec![(addr.to_string(), 1)],
        }
    }
}

impl From<String> for ServerList {
    fn from(addr: String) -> Self {
        Self {
            entries: vec![(addr, 1)],
        }
    }
}

impl From<Vec<String>> for ServerList {
    fn from(addrs: Vec<String>) -> Self {
        Self {
            entries: addrs.into_iter().map(|addr| (addr, 1)).collect(),
        }
    }
}

impl From<Vec<&str>> for ServerList {
    fn from(addrs: Vec<&str>) -> Self {
        Self::from(&addrs[..])
    }
}

impl From<&[&str]> for ServerList {
    fn from(addrs: &[&str]) -> Self {
        Self {
            entries: addrs.iter().map(|addr| (addr.to_string(), 1)).collect(),
        }
    }
}

impl<const N: usize> From<[&str; N]> for ServerList {
    fn from(addrs: [&str; N]) -> Self {
        Self::from(&addrs[..])
    }
}

impl From<HashMap<String, u32>> for ServerList {
    fn from(weighted: HashMap<String, u32>) -> Self {
        let mut entries: Vec<(String, u32)> = weighted.into_iter().collect();
        // HashMap iteration order is random; keep construction deterministic.
        entries.sort();
        Self { entries }
    }
}
