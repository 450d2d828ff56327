// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{download::FetchPolicy, peer::PeerAddr};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub bind_tcp: SocketAddr,
    /// Address reported to peers in search answers. Defaults to the bound
    /// address; an unspecified IP is replaced by the asking side with the
    /// address it connected to.
    pub advertise_ip: Option<IpAddr>,
    /// How many successive ports to try when `bind_tcp` is taken.
    pub port_retry_limit: u16,
    pub share_dir: PathBuf,
    /// Where finished downloads land. Defaults to `share_dir`.
    pub download_dir: Option<PathBuf>,
    pub bootstrap_peers: Vec<String>,
    pub log_level: String,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub workers: usize,
    pub response_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_block_attempts: Option<u32>,
    pub retry_backoff_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_tcp: SocketAddr::from(([0, 0, 0, 0], 7001)),
            advertise_ip: None,
            port_retry_limit: 16,
            share_dir: PathBuf::from("shared"),
            download_dir: None,
            bootstrap_peers: vec![],
            log_level: "info".to_string(),
            download: DownloadConfig::default(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let policy = FetchPolicy::default();
        Self {
            workers: policy.workers,
            response_timeout_ms: policy.response_timeout.as_millis() as u64,
            connect_timeout_ms: policy.connect_timeout.as_millis() as u64,
            max_block_attempts: policy.max_block_attempts,
            retry_backoff_ms: policy.retry_backoff.as_millis() as u64,
        }
    }
}

impl DownloadConfig {
    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            workers: self.workers,
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            max_block_attempts: self.max_block_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.download.workers == 0 {
            anyhow::bail!("download.workers must be at least 1");
        }
        if self.download.response_timeout_ms == 0 {
            anyhow::bail!("download.response_timeout_ms must be positive");
        }
        if self.download.max_block_attempts == Some(0) {
            anyhow::bail!("download.max_block_attempts must be at least 1 when set");
        }
        self.bootstrap_peers()?;
        Ok(())
    }

    pub fn bootstrap_peers(&self) -> anyhow::Result<Vec<PeerAddr>> {
        self.bootstrap_peers
            .iter()
            .map(|peer| peer.parse())
            .collect()
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| self.share_dir.clone())
    }

    /// Address peers should use to reach this node once `bound` is known.
    pub fn advertised_addr(&self, bound: SocketAddr) -> PeerAddr {
        PeerAddr::new(self.advertise_ip.unwrap_or(bound.ip()), bound.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = NodeConfig::from_toml_str("").expect("parse");
        assert_eq!(config, NodeConfig::default());
        assert_eq!(config.download.fetch_policy().workers, 5);
        assert_eq!(config.download_dir(), PathBuf::from("shared"));
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config = NodeConfig::from_toml_str(
            r#"
            bind_tcp = "127.0.0.1:9100"
            share_dir = "/srv/share"
            download_dir = "/srv/incoming"
            bootstrap_peers = ["10.0.0.2:7001", "10.0.0.3:7001"]

            [download]
            max_block_attempts = 8
            retry_backoff_ms = 250
            "#,
        )
        .expect("parse");
        assert_eq!(config.bind_tcp.port(), 9100);
        assert_eq!(config.download_dir(), PathBuf::from("/srv/incoming"));
        assert_eq!(config.bootstrap_peers().expect("peers").len(), 2);

        let policy = config.download.fetch_policy();
        assert_eq!(policy.max_block_attempts, Some(8));
        assert_eq!(policy.retry_backoff, Duration::from_millis(250));
        assert_eq!(policy.workers, 5);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(NodeConfig::from_toml_str("[download]\nworkers = 0").is_err());
        assert!(NodeConfig::from_toml_str("bootstrap_peers = [\"nope\"]").is_err());
        assert!(NodeConfig::from_toml_str("[download]\nmax_block_attempts = 0").is_err());
    }

    #[test]
    fn advertised_addr_prefers_configured_ip() {
        let bound: SocketAddr = "0.0.0.0:7005".parse().expect("addr");
        let mut config = NodeConfig::default();
        assert_eq!(config.advertised_addr(bound).to_string(), "0.0.0.0:7005");
        config.advertise_ip = Some("192.168.1.20".parse().expect("ip"));
        assert_eq!(
            config.advertised_addr(bound).to_string(),
            "192.168.1.20:7005"
        );
    }
}
