//! Low-level packet crafting and raw network I/O for the reachability
//! and port-discovery engines.
//!
//! # Examples
//!
//! ```no_run
//! use prtip_network::interface::get_source_ip_for_target;
//!
//! let source_ip = get_source_ip_for_target("192.168.1.1".parse().unwrap()).unwrap();
//! println!("scanning from {}", source_ip);
//! ```

pub mod checksum;
pub mod frame;
pub mod interface;
pub mod ipv4;
pub mod raw_send;
#[cfg(target_os = "linux")]
pub mod ring;
pub mod tcp;

pub use checksum::{ipv4_checksum, ones_complement_checksum, tcp_checksum_v4};
pub use frame::{parse_ethernet, EthernetFrame};
pub use interface::{get_source_ip_for_target, NetworkInterface};
pub use ipv4::{build_ipv4_header, parse_ipv4, Ipv4Header};
pub use raw_send::{IcmpDatagramSocket, RawIcmpSendSocket, RawTcpSendSocket};
pub use tcp::{build_syn_segment, parse_tcp, TcpFlags, TcpHeader};
