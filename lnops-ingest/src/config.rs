use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::backfill::{clamp_page_size, MAX_PAGE_SIZE};
use crate::model::{Chain, Network, NodeId, NodeSettings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Settings of the ingestors of one node backend.
///
/// Read from a TOML file with kebab-case keys; every key is optional. Each
/// key can be overridden by an environment variable named `LNOPS_` followed
/// by the key in upper snake case, e.g. `LNOPS_FORWARD_PAGE_SIZE`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct IngestConfig {
    pub chain: Chain,
    pub network: Network,
    /// Internal id of the monitored node
    pub local_node_id: i32,
    pub forward_page_size: u32,
    pub transaction_page_size: u32,
    pub forward_poll_interval_secs: u64,
    /// Minimum time between two reconnect attempts of one worker
    pub reconnect_interval_millis: u64,
    pub bus_capacity: usize,
    pub cache_mailbox_capacity: usize,
    pub forwards: bool,
    pub htlc_events: bool,
    pub transactions: bool,
    pub channel_graph: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            chain: Chain::Bitcoin,
            network: Network::MainNet,
            local_node_id: 1,
            forward_page_size: MAX_PAGE_SIZE,
            transaction_page_size: 10_000,
            forward_poll_interval_secs: 10,
            reconnect_interval_millis: 1_000,
            bus_capacity: 1_024,
            cache_mailbox_capacity: 1_000,
            forwards: true,
            htlc_events: true,
            transactions: true,
            channel_graph: true,
        }
    }
}

fn override_with<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(name) {
        *target = value.trim().parse().map_err(|_| ConfigError::Invalid(name, value))?;
    }
    Ok(())
}

impl IngestConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: IngestConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `LNOPS_*` environment overrides.
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn with_overrides<F: Fn(&str) -> Option<String>>(
        mut self,
        lookup: F,
    ) -> Result<Self, ConfigError> {
        override_with(&lookup, "LNOPS_CHAIN", &mut self.chain)?;
        override_with(&lookup, "LNOPS_NETWORK", &mut self.network)?;
        override_with(&lookup, "LNOPS_LOCAL_NODE_ID", &mut self.local_node_id)?;
        override_with(&lookup, "LNOPS_FORWARD_PAGE_SIZE", &mut self.forward_page_size)?;
        override_with(&lookup, "LNOPS_TRANSACTION_PAGE_SIZE", &mut self.transaction_page_size)?;
        override_with(
            &lookup,
            "LNOPS_FORWARD_POLL_INTERVAL_SECS",
            &mut self.forward_poll_interval_secs,
        )?;
        override_with(
            &lookup,
            "LNOPS_RECONNECT_INTERVAL_MILLIS",
            &mut self.reconnect_interval_millis,
        )?;
        override_with(&lookup, "LNOPS_BUS_CAPACITY", &mut self.bus_capacity)?;
        override_with(&lookup, "LNOPS_CACHE_MAILBOX_CAPACITY", &mut self.cache_mailbox_capacity)?;
        override_with(&lookup, "LNOPS_FORWARDS", &mut self.forwards)?;
        override_with(&lookup, "LNOPS_HTLC_EVENTS", &mut self.htlc_events)?;
        override_with(&lookup, "LNOPS_TRANSACTIONS", &mut self.transactions)?;
        override_with(&lookup, "LNOPS_CHANNEL_GRAPH", &mut self.channel_graph)?;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("forward-poll-interval-secs", self.forward_poll_interval_secs),
            ("reconnect-interval-millis", self.reconnect_interval_millis),
            ("bus-capacity", self.bus_capacity as u64),
            ("cache-mailbox-capacity", self.cache_mailbox_capacity as u64),
            ("transaction-page-size", u64::from(self.transaction_page_size)),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(name, value.to_string()));
            }
        }
        if self.local_node_id <= 0 {
            return Err(ConfigError::Invalid("local-node-id", self.local_node_id.to_string()));
        }
        Ok(())
    }

    pub fn node_settings(&self) -> NodeSettings {
        let node_id = NodeId(self.local_node_id);
        NodeSettings { node_id, chain: self.chain, network: self.network }
    }

    /// The forward page size, clamped to what a backend accepts.
    pub fn forward_page_size(&self) -> u32 {
        clamp_page_size(self.forward_page_size, MAX_PAGE_SIZE)
    }

    pub fn transaction_page_size(&self) -> u32 {
        clamp_page_size(self.transaction_page_size, MAX_PAGE_SIZE)
    }

    pub fn forward_poll_interval(&self) -> Duration {
        Duration::from_secs(self.forward_poll_interval_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_millis)
    }
}
