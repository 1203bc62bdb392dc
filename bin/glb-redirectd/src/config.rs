// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Daemon configuration.
//!
//! Read from a TOML file, then overridden piecemeal from the command
//! line. Every field has a default except the node's own address.

use glb_api::DEF_MAX_HOPS;
use glb_api::Listener;
use glb_api::MAX_HOPS;
use glb_redirect::engine::conn_table::CONN_TABLE_DEF_SHARDS;
use glb_redirect::engine::conn_table::ConnTableCfg;
use glb_redirect::engine::flow_table::FLOW_DEF_EXPIRE_SECS;
use glb_redirect::engine::flow_table::FLOW_TABLE_DEF_MAX_ENTRIES;
use glb_redirect::engine::flow_table::Ttl;
use glb_redirect::engine::redirect::RedirectCfg;
use serde::Deserialize;
use serde::Serialize;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub const DEF_WORKERS: usize = 4;
pub const DEF_STATS_INTERVAL_SECS: u64 = 60;
pub const DEF_LOG_LEVEL: &str = "info";

/// Errors loading or validating a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no local address given")]
    NoLocalAddr,

    #[error("local address {0} is not IPv4")]
    UnsupportedFamily(IpAddr),

    #[error("max_hops must be between 1 and {MAX_HOPS}, got {0}")]
    MaxHops(u8),

    #[error("at least one worker is required")]
    NoWorkers,

    #[error("max_flows must be non-zero")]
    NoFlows,

    #[error("flow_ttl_secs must be non-zero")]
    NoFlowTtl,

    #[error("invalid log level {0:?}")]
    LogLevel(String),
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ListenerCfg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<IpAddr>,
    pub port: u16,
}

impl From<&ListenerCfg> for Listener {
    fn from(cfg: &ListenerCfg) -> Self {
        Listener { addr: cfg.addr.map(Into::into), port: cfg.port }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// This node's address on the encapsulation network.
    #[serde(default)]
    pub local_addr: Option<IpAddr>,

    #[serde(default = "default_max_hops")]
    pub max_hops: u8,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_flow_ttl_secs")]
    pub flow_ttl_secs: u64,

    #[serde(default = "default_max_flows")]
    pub max_flows: u32,

    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Services new connections may be adopted for.
    #[serde(default)]
    pub listeners: Vec<ListenerCfg>,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How often to log counters; zero disables.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_max_hops() -> u8 {
    DEF_MAX_HOPS
}

fn default_workers() -> usize {
    DEF_WORKERS
}

fn default_flow_ttl_secs() -> u64 {
    FLOW_DEF_EXPIRE_SECS
}

fn default_max_flows() -> u32 {
    FLOW_TABLE_DEF_MAX_ENTRIES
}

fn default_shards() -> usize {
    CONN_TABLE_DEF_SHARDS
}

fn default_log_level() -> String {
    DEF_LOG_LEVEL.to_string()
}

fn default_stats_interval_secs() -> u64 {
    DEF_STATS_INTERVAL_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_addr: None,
            max_hops: default_max_hops(),
            workers: default_workers(),
            flow_ttl_secs: default_flow_ttl_secs(),
            max_flows: default_max_flows(),
            shards: default_shards(),
            listeners: vec![],
            log_level: default_log_level(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl FromStr for Config {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| {
            ConfigError::Read { path: path.to_path_buf(), source }
        })?;

        text.parse().map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check every field, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let local_addr = self.local_addr.ok_or(ConfigError::NoLocalAddr)?;
        if !local_addr.is_ipv4() {
            return Err(ConfigError::UnsupportedFamily(local_addr));
        }

        if self.max_hops == 0 || usize::from(self.max_hops) > MAX_HOPS {
            return Err(ConfigError::MaxHops(self.max_hops));
        }

        if self.workers == 0 || self.shards == 0 {
            return Err(ConfigError::NoWorkers);
        }

        if self.max_flows == 0 {
            return Err(ConfigError::NoFlows);
        }

        if self.flow_ttl_secs == 0 {
            return Err(ConfigError::NoFlowTtl);
        }

        if slog::FilterLevel::from_str(&self.log_level).is_err() {
            return Err(ConfigError::LogLevel(self.log_level.clone()));
        }

        Ok(())
    }

    pub fn redirect_cfg(&self) -> Result<RedirectCfg, ConfigError> {
        let local_addr = self.local_addr.ok_or(ConfigError::NoLocalAddr)?;
        Ok(RedirectCfg {
            local_addr: local_addr.into(),
            max_hops: self.max_hops,
        })
    }

    pub fn conn_table_cfg(&self) -> Result<ConnTableCfg, ConfigError> {
        Ok(ConnTableCfg {
            listeners: self.listeners.iter().map(Listener::from).collect(),
            ttl: Ttl::new_seconds(self.flow_ttl_secs),
            max_flows: NonZeroU32::new(self.max_flows)
                .ok_or(ConfigError::NoFlows)?,
            shards: NonZeroUsize::new(self.shards)
                .ok_or(ConfigError::NoWorkers)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const FULL: &str = r#"
        local_addr = "192.168.50.10"
        max_hops = 8
        workers = 2
        flow_ttl_secs = 30

        [[listeners]]
        port = 22

        [[listeners]]
        addr = "10.10.10.10"
        port = 80
    "#;

    #[test]
    fn parse_full() {
        let cfg: Config = FULL.parse().unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.max_hops, 8);
        assert_eq!(cfg.max_flows, FLOW_TABLE_DEF_MAX_ENTRIES);
        assert_eq!(cfg.log_level, "info");

        let ct = cfg.conn_table_cfg().unwrap();
        assert_eq!(ct.ttl.as_seconds(), 30);
        assert_eq!(ct.listeners[0], Listener::any(22));
        assert_eq!(
            ct.listeners[1].addr,
            Some("10.10.10.10".parse::<glb_api::IpAddr>().unwrap())
        );

        let rc = cfg.redirect_cfg().unwrap();
        assert_eq!(rc.local_addr.to_string(), "192.168.50.10");
    }

    #[test]
    fn validation() {
        let base: Config = FULL.parse().unwrap();

        let cfg = Config { local_addr: None, ..base.clone() };
        assert!(matches!(cfg.validate(), Err(ConfigError::NoLocalAddr)));

        let cfg = Config {
            local_addr: Some("fd00::1".parse().unwrap()),
            ..base.clone()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnsupportedFamily(_))
        ));

        let cfg = Config { max_hops: 31, ..base.clone() };
        assert!(matches!(cfg.validate(), Err(ConfigError::MaxHops(31))));

        let cfg = Config { workers: 0, ..base.clone() };
        assert!(matches!(cfg.validate(), Err(ConfigError::NoWorkers)));

        let cfg = Config { log_level: "loud".into(), ..base };
        assert!(matches!(cfg.validate(), Err(ConfigError::LogLevel(_))));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!("max_hopz = 3".parse::<Config>().is_err());
    }
}
