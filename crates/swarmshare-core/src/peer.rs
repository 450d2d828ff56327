// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl FromStr for PeerAddr {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = value
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid peer address {value:?}: {err}"))?;
        Ok(addr.into())
    }
}

/// Renders as `ip:port`, which is also the key used for per-peer counters.
impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_addr_parses_and_displays() {
        let addr: PeerAddr = "127.0.0.1:7001".parse().expect("valid peer");
        assert_eq!(addr.port, 7001);
        assert_eq!(addr.to_string(), "127.0.0.1:7001");

        let v6: PeerAddr = "[::1]:9000".parse().expect("valid v6 peer");
        assert_eq!(v6.to_string(), "[::1]:9000");
    }

    #[test]
    fn peer_addr_rejects_missing_port() {
        assert!("10.0.0.1".parse::<PeerAddr>().is_err());
    }
}
