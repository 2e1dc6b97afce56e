//! Connection gater: allow/deny multiaddr prefixes and CIDR blocks.
//!
//! The gater is consulted before every outbound dial and on every inbound
//! connection; a denied inbound connection is closed by the host driver.

use crate::addrs::ip_of;
use crate::config::GaterOptions;
use crate::types::NetworkError;
use libp2p::Multiaddr;
use std::net::IpAddr;

/// A parsed CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cidr {
    network: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    fn parse(s: &str) -> Result<Self, NetworkError> {
        let invalid = || {
            NetworkError::ConfigInvalid(format!(
                "p2p.gater.deny_cidrs entry {s:?} is not a CIDR block (e.g. 10.0.0.0/8)"
            ))
        };
        let (ip_part, len_part) = s.split_once('/').ok_or_else(invalid)?;
        let network: IpAddr = ip_part.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = len_part.parse().map_err(|_| invalid())?;
        let max = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(invalid());
        }
        Ok(Self {
            network,
            prefix_len,
        })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix_len as u32)
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix_len as u32)
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

/// Prefix / CIDR connection gater.
pub struct ConnectionGater {
    allow_prefixes: Vec<String>,
    deny_prefixes: Vec<String>,
    deny_cidrs: Vec<Cidr>,
}

impl ConnectionGater {
    /// Build a gater from resolved options. Invalid CIDR entries are a
    /// configuration error.
    pub fn new(options: &GaterOptions) -> Result<Self, NetworkError> {
        let deny_cidrs = options
            .deny_cidrs
            .iter()
            .map(|s| Cidr::parse(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            allow_prefixes: options.allow_prefixes.clone(),
            deny_prefixes: options.deny_prefixes.clone(),
            deny_cidrs,
        })
    }

    /// Whether an address may be dialed or accepted.
    pub fn permits(&self, addr: &Multiaddr) -> bool {
        let text = addr.to_string();
        if self.deny_prefixes.iter().any(|p| text.starts_with(p)) {
            return false;
        }
        if let Some(ip) = ip_of(addr) {
            if self.deny_cidrs.iter().any(|c| c.contains(ip)) {
                return false;
            }
        }
        if self.allow_prefixes.is_empty() {
            return true;
        }
        self.allow_prefixes.iter().any(|p| text.starts_with(p))
    }

    /// Drop gated addresses from a dial set.
    pub fn filter(&self, addrs: Vec<Multiaddr>) -> Vec<Multiaddr> {
        addrs.into_iter().filter(|a| self.permits(a)).collect()
    }

    /// Summary of the configured rules, for diagnostics.
    pub fn summary(&self) -> (Vec<String>, Vec<String>, usize) {
        (
            self.allow_prefixes.clone(),
            self.deny_prefixes.clone(),
            self.deny_cidrs.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gater(allow: &[&str], deny: &[&str], cidrs: &[&str]) -> ConnectionGater {
        ConnectionGater::new(&GaterOptions {
            allow_prefixes: allow.iter().map(|s| s.to_string()).collect(),
            deny_prefixes: deny.iter().map(|s| s.to_string()).collect(),
            deny_cidrs: cidrs.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    fn ma(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn open_gater_permits_everything() {
        let g = gater(&[], &[], &[]);
        assert!(g.permits(&ma("/ip4/203.0.113.9/tcp/1")));
    }

    #[test]
    fn deny_prefix_wins() {
        let g = gater(&[], &["/ip4/203.0.113."], &[]);
        assert!(!g.permits(&ma("/ip4/203.0.113.9/tcp/1")));
        assert!(g.permits(&ma("/ip4/198.51.100.9/tcp/1")));
    }

    #[test]
    fn deny_cidr_blocks_range() {
        let g = gater(&[], &[], &["10.0.0.0/8"]);
        assert!(!g.permits(&ma("/ip4/10.200.3.4/tcp/1")));
        assert!(g.permits(&ma("/ip4/11.0.0.1/tcp/1")));
    }

    #[test]
    fn allowlist_restricts() {
        let g = gater(&["/ip4/192.168."], &[], &[]);
        assert!(g.permits(&ma("/ip4/192.168.1.4/tcp/1")));
        assert!(!g.permits(&ma("/ip4/203.0.113.9/tcp/1")));
    }

    #[test]
    fn bad_cidr_is_config_error() {
        let result = ConnectionGater::new(&GaterOptions {
            deny_cidrs: vec!["10.0.0.0/99".into()],
            ..GaterOptions::default()
        });
        assert!(matches!(result, Err(NetworkError::ConfigInvalid(_))));
    }
}
