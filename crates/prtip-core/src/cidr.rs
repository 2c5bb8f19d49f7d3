//! CIDR expansion, eliding the network and broadcast address for
//! non-/32 networks.
//!
//! Kept as a small leaf utility rather than a subsystem: spec places
//! "CIDR expansion utilities" out of scope as an external planner
//! concern, but §8's testable property and §9's worked example still
//! require the elision rule to live somewhere reachable by tests in this
//! crate. Grounded on the teacher's `ScanTarget::host_count`/
//! `expand_hosts` in the original `prtip-core/src/types.rs`.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::error::{Error, Result};

/// Expand a CIDR string into its usable IPv4 hosts.
///
/// `/32` expands to exactly the one address. Any other prefix elides the
/// network and broadcast addresses.
pub fn expand_cidr(cidr: &str) -> Result<Vec<Ipv4Addr>> {
    let network: Ipv4Network = cidr
        .parse()
        .map_err(|e| Error::InvalidCidr(format!("{}: {}", cidr, e)))?;

    if network.prefix() == 32 {
        return Ok(vec![network.ip()]);
    }

    let network_addr = network.network();
    let broadcast_addr = network.broadcast();
    Ok(network
        .iter()
        .filter(|ip| *ip != network_addr && *ip != broadcast_addr)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_slash_30_elides_network_and_broadcast() {
        let hosts = expand_cidr("10.0.0.0/30").unwrap();
        let expected: Vec<Ipv4Addr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        assert_eq!(hosts, expected);
    }

    #[test]
    fn test_expand_slash_32_is_single_host() {
        let hosts = expand_cidr("10.0.0.1/32").unwrap();
        assert_eq!(hosts, vec!["10.0.0.1".parse::<Ipv4Addr>().unwrap()]);
    }

    #[test]
    fn test_expand_invalid_cidr_errors() {
        let result = expand_cidr("not-a-cidr");
        assert!(matches!(result, Err(Error::InvalidCidr(_))));
    }

    #[test]
    fn test_expand_slash_24_excludes_endpoints() {
        let hosts = expand_cidr("192.168.1.0/24").unwrap();
        assert_eq!(hosts.len(), 254);
        assert!(!hosts.contains(&"192.168.1.0".parse().unwrap()));
        assert!(!hosts.contains(&"192.168.1.255".parse().unwrap()));
    }
}
