// ABOUTME: Host-based access rules for both instances
// ABOUTME: Validates the trusted subnet and renders pg_hba.conf with trust rules scoped to it

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::config::ADMIN_ROLE;
use crate::error::SetupError;

/// A CIDR block such as `10.0.0.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

impl Subnet {
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

fn mask_u32(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p)),
    }
}

fn mask_u128(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p => u128::MAX << (128 - u32::from(p)),
    }
}

impl FromStr for Subnet {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid =
            |why: &str| SetupError::Environment(format!("invalid subnet '{}': {}", s, why));

        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid("expected CIDR notation such as 10.0.0.0/24"))?;
        let network: IpAddr = addr.parse().map_err(|_| invalid("bad network address"))?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid("bad prefix length"))?;

        let max = if network.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(invalid("prefix length out of range"));
        }

        Ok(Self { network, prefix })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Renders pg_hba.conf.
///
/// The admin account authenticates by peer on the local socket. Everything
/// else from localhost or `subnet` is trusted, including replication.
pub fn render_pg_hba(subnet: &Subnet) -> String {
    let subnet = subnet.to_string();
    let rules = [
        ("local", "all", ADMIN_ROLE, "", "peer"),
        ("local", "all", "all", "", "trust"),
        ("host", "all", "all", "127.0.0.1/32", "trust"),
        ("host", "all", "all", "::1/128", "trust"),
        ("host", "all", "all", subnet.as_str(), "trust"),
        ("local", "replication", "all", "", "trust"),
        ("host", "replication", "all", "127.0.0.1/32", "trust"),
        ("host", "replication", "all", subnet.as_str(), "trust"),
    ];

    let mut out = String::from(
        "# Managed by pg-bidi-setup. Trust authentication is for test environments only.\n\
         # TYPE  DATABASE        USER            ADDRESS                 METHOD\n",
    );
    for (kind, database, user, address, method) in rules {
        out.push_str(&format!(
            "{:<7} {:<15} {:<15} {:<23} {}\n",
            kind, database, user, address, method
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_contains() {
        let subnet: Subnet = "10.0.0.0/24".parse().unwrap();
        assert!(subnet.contains("10.0.0.17".parse().unwrap()));
        assert!(!subnet.contains("10.0.1.17".parse().unwrap()));
        assert!(!subnet.contains("::1".parse().unwrap()));
        assert_eq!(subnet.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn test_edge_prefixes() {
        let all: Subnet = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains("203.0.113.9".parse().unwrap()));

        let host: Subnet = "192.168.1.10/32".parse().unwrap();
        assert!(host.contains("192.168.1.10".parse().unwrap()));
        assert!(!host.contains("192.168.1.11".parse().unwrap()));

        let v6: Subnet = "fd00::/8".parse().unwrap();
        assert!(v6.contains("fd12::1".parse().unwrap()));
        assert!(!v6.contains("fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_rejects_malformed_subnets() {
        for bad in ["10.0.0.0", "10.0.0.0/33", "10.0.0/24", "garbage/8", "::/129"] {
            let err = bad.parse::<Subnet>().unwrap_err();
            assert!(
                matches!(err, SetupError::Environment(_)),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_hba_trusts_only_localhost_and_subnet() {
        let subnet: Subnet = "10.20.0.0/16".parse().unwrap();
        let hba = render_pg_hba(&subnet);

        let host_addresses: Vec<&str> = hba
            .lines()
            .filter(|line| line.starts_with("host"))
            .filter_map(|line| line.split_whitespace().nth(3))
            .collect();
        assert_eq!(
            host_addresses,
            vec!["127.0.0.1/32", "::1/128", "10.20.0.0/16", "127.0.0.1/32", "10.20.0.0/16"]
        );

        let first_rule = hba.lines().find(|line| !line.starts_with('#')).unwrap();
        assert_eq!(
            first_rule.split_whitespace().collect::<Vec<_>>(),
            vec!["local", "all", "postgres", "peer"]
        );
        assert!(hba.contains("host    replication     all             10.20.0.0/16            trust"));
    }
}
