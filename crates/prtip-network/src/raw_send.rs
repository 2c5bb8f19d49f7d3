//! Raw IPv4 send sockets: `IP_HDRINCL` TCP (for SYN packets) and plain
//! ICMP (for Echo requests).
//!
//! Grounded on `other_examples/.../Phobos/socket.rs`'s `RawSocket`
//! (socket2 + libc construction, `PermissionDenied` → privilege error
//! classification) since the teacher itself never opens a raw
//! `AF_INET`/`IPPROTO_TCP` socket directly — it always goes through
//! `pnet_datalink`'s Ethernet channel abstraction.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use prtip_core::{Error, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

fn map_construction_error(err: io::Error, what: &str) -> Error {
    if err.kind() == io::ErrorKind::PermissionDenied {
        Error::Privilege(format!("{}: permission denied (need CAP_NET_RAW)", what))
    } else {
        Error::Network(format!("{}: {}", what, err))
    }
}

/// Raw `AF_INET`/`IPPROTO_TCP` socket with `IP_HDRINCL` set, used by the
/// SYN scanner to transmit hand-built IPv4+TCP bytes.
pub struct RawTcpSendSocket {
    socket: Socket,
}

impl RawTcpSendSocket {
    pub fn new() -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP))
            .map_err(|e| map_construction_error(e, "raw TCP socket"))?;
        socket
            .set_header_included(true)
            .map_err(|e| map_construction_error(e, "IP_HDRINCL"))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::Network(format!("set_nonblocking: {}", e)))?;
        Ok(Self { socket })
    }

    /// Send a fully-formed IPv4+TCP datagram (no Ethernet framing).
    pub fn send_to(&self, packet: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        let addr = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(dst, 0)));
        self.socket.send_to(packet, &addr)
    }
}

/// Raw `AF_INET`/`IPPROTO_ICMP` send socket for Echo requests.
pub struct RawIcmpSendSocket {
    socket: Socket,
}

impl RawIcmpSendSocket {
    pub fn new() -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(|e| map_construction_error(e, "raw ICMP socket"))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::Network(format!("set_nonblocking: {}", e)))?;
        Ok(Self { socket })
    }

    pub fn send_to(&self, packet: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        let addr = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(dst, 0)));
        self.socket.send_to(packet, &addr)
    }
}

/// An ordinary ICMP datagram endpoint (`SOCK_DGRAM`/`IPPROTO_ICMP`),
/// bound to `0.0.0.0`, used both as the ICMP sweeper's receive endpoint
/// and as the one-shot fallback send path on EINVAL/EADDRNOTAVAIL/
/// EAFNOSUPPORT per spec §4.2 step 2.
pub struct IcmpDatagramSocket {
    socket: Socket,
}

impl IcmpDatagramSocket {
    pub fn bind_any() -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))
            .map_err(|e| map_construction_error(e, "ICMP datagram socket"))?;
        let addr = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
        socket
            .bind(&addr)
            .map_err(|e| Error::Network(format!("bind: {}", e)))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::Network(format!("set_nonblocking: {}", e)))?;
        Ok(Self { socket })
    }

    pub fn send_to(&self, packet: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        let addr = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(dst, 0)));
        self.socket.send_to(packet, &addr)
    }

    /// Receive into `buf`, returning the sender's address. Never blocks
    /// longer than the caller's own read-deadline discipline (the socket
    /// is non-blocking; `WouldBlock` is the normal "nothing yet" case).
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)> {
        use std::mem::MaybeUninit;
        let uninit: &mut [MaybeUninit<u8>] = unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast(), buf.len())
        };
        let (size, addr) = self.socket.recv_from(uninit)?;
        let src = match addr.as_socket_ipv4() {
            Some(v4) => *v4.ip(),
            None => Ipv4Addr::UNSPECIFIED,
        };
        Ok((size, src))
    }
}

/// Classify a `sendto` errno per spec §7's transport taxonomy: EINVAL,
/// EADDRNOTAVAIL, EAFNOSUPPORT are "invalid destination"; everything
/// else is a plain send error recorded on the target's Result.
///
/// `libc` is only a dependency on unix (see `prtip-network/Cargo.toml`);
/// the ICMP sweeper and TCP connect sweeper that call this must still
/// compile on other targets, so the non-unix arm falls back to the
/// nearest `std::io::ErrorKind` equivalents instead of raw errnos.
#[cfg(unix)]
pub fn is_invalid_destination(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINVAL) | Some(libc::EADDRNOTAVAIL) | Some(libc::EAFNOSUPPORT)
    )
}

#[cfg(not(unix))]
pub fn is_invalid_destination(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::AddrNotAvailable
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_invalid_destination_classification() {
        let err = io::Error::from_raw_os_error(libc::EINVAL);
        assert!(is_invalid_destination(&err));
        let err = io::Error::from_raw_os_error(libc::EADDRNOTAVAIL);
        assert!(is_invalid_destination(&err));
        let err = io::Error::from_raw_os_error(libc::ECONNREFUSED);
        assert!(!is_invalid_destination(&err));
    }

    #[cfg(not(unix))]
    #[test]
    fn test_invalid_destination_classification() {
        let err = io::Error::from(io::ErrorKind::InvalidInput);
        assert!(is_invalid_destination(&err));
        let err = io::Error::from(io::ErrorKind::AddrNotAvailable);
        assert!(is_invalid_destination(&err));
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(!is_invalid_destination(&err));
    }
}
