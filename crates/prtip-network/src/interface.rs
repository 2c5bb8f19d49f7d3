//! Local egress IP and interface discovery (IPv4 only, per non-goals).
//!
//! Transformed from the teacher's direct-enumeration
//! `find_interface_for_target` into spec §4.5's two-step algorithm:
//! resolve the routed local IP via a UDP "connect" trick first, then
//! scan interfaces for the matching address, falling back to the first
//! up non-loopback interface with an IPv4 address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use pnet_datalink as datalink;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("No suitable network interface found")]
    NoInterfaceFound,

    #[error("Failed to enumerate network interfaces: {0}")]
    EnumerationFailed(String),

    #[error("Interface {0} has no IPv4 address")]
    NoIpv4(String),

    #[error("Invalid interface specification: {0}")]
    InvalidInterface(String),
}

impl From<InterfaceError> for prtip_core::Error {
    fn from(err: InterfaceError) -> Self {
        match err {
            InterfaceError::NoInterfaceFound => prtip_core::Error::NoInterface,
            InterfaceError::NoIpv4(_) => prtip_core::Error::InterfaceNoIpv4,
            other => prtip_core::Error::Network(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    pub index: u32,
    pub mac_address: Option<[u8; 6]>,
    pub ipv4_addresses: Vec<Ipv4Addr>,
    pub is_up: bool,
    pub is_loopback: bool,
}

impl NetworkInterface {
    pub fn has_ipv4(&self) -> bool {
        !self.ipv4_addresses.is_empty()
    }

    pub fn first_ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4_addresses.first().copied()
    }
}

pub fn enumerate_interfaces() -> Result<Vec<NetworkInterface>, InterfaceError> {
    let interfaces = datalink::interfaces();
    let mut result = Vec::with_capacity(interfaces.len());

    for iface in interfaces {
        let ipv4_addresses = iface
            .ips
            .iter()
            .filter_map(|net| match net.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect();

        result.push(NetworkInterface {
            name: iface.name.clone(),
            index: iface.index,
            mac_address: iface.mac.map(|mac| mac.octets()),
            ipv4_addresses,
            is_up: iface.is_up(),
            is_loopback: iface.is_loopback(),
        });
    }

    Ok(result)
}

/// Learn the locally-routed IPv4 address for reaching `target` by
/// "connecting" a UDP socket (no packets are actually sent for a UDP
/// connect — the kernel only resolves the route) and reading back the
/// socket's local address.
fn routed_local_ip(target: Ipv4Addr) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect(SocketAddr::new(IpAddr::V4(target), 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    }
}

/// Find the interface to use for reaching `target`: first try to match
/// the UDP-connect-trick's routed local IP against an interface's
/// address list, then fall back to the first up, non-loopback interface
/// with an IPv4 address.
pub fn find_interface_for_target(target: Ipv4Addr) -> Result<NetworkInterface, InterfaceError> {
    let interfaces = enumerate_interfaces()?;

    if let Some(local_ip) = routed_local_ip(target) {
        if let Some(iface) = interfaces
            .iter()
            .find(|iface| iface.ipv4_addresses.contains(&local_ip))
        {
            debug!(%target, interface = %iface.name, "interface: resolved via routed local ip");
            return Ok(iface.clone());
        }
    }

    debug!(%target, "interface: routed local ip trick missed, falling back to enumeration");
    interfaces
        .into_iter()
        .find(|iface| iface.is_up && !iface.is_loopback && iface.has_ipv4())
        .ok_or(InterfaceError::NoInterfaceFound)
}

pub fn get_source_ip_for_target(target: Ipv4Addr) -> Result<Ipv4Addr, InterfaceError> {
    let interface = find_interface_for_target(target)?;
    interface
        .first_ipv4()
        .ok_or_else(|| InterfaceError::NoIpv4(interface.name.clone()))
}

pub fn find_interface_by_name(name: &str) -> Result<NetworkInterface, InterfaceError> {
    enumerate_interfaces()?
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| InterfaceError::InvalidInterface(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_interfaces_has_loopback() {
        let interfaces = enumerate_interfaces().unwrap();
        assert!(!interfaces.is_empty());
        assert!(interfaces.iter().any(|iface| iface.is_loopback));
    }

    #[test]
    fn test_find_interface_for_localhost() {
        let target: Ipv4Addr = "127.0.0.1".parse().unwrap();
        let result = find_interface_for_target(target);
        assert!(result.is_ok());
    }

    #[test]
    fn test_get_source_ip_for_localhost() {
        let target: Ipv4Addr = "127.0.0.1".parse().unwrap();
        assert!(get_source_ip_for_target(target).is_ok());
    }

    #[test]
    fn test_find_interface_by_name_invalid() {
        let result = find_interface_by_name("definitely-not-a-real-interface-name-12345");
        assert!(result.is_err());
    }

    #[test]
    fn test_network_interface_helpers() {
        let iface = NetworkInterface {
            name: "test0".to_string(),
            index: 1,
            mac_address: None,
            ipv4_addresses: vec!["192.168.1.1".parse().unwrap()],
            is_up: true,
            is_loopback: false,
        };
        assert!(iface.has_ipv4());
        assert_eq!(iface.first_ipv4(), Some("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_network_interface_no_addresses() {
        let iface = NetworkInterface {
            name: "test0".to_string(),
            index: 2,
            mac_address: None,
            ipv4_addresses: vec![],
            is_up: true,
            is_loopback: false,
        };
        assert!(!iface.has_ipv4());
        assert!(iface.first_ipv4().is_none());
    }
}
