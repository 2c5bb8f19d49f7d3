//! TCP header parsing and bit-exact SYN-packet construction.
//!
//! `TcpFlags` keeps the teacher's bitmask shape from the old
//! `packet_builder.rs` (`FIN`/`SYN`/`RST`/... constants, `combine`/`has`)
//! since it matches the wire layout exactly; everything else here is new
//! — spec's fixed-field SYN packet (data-offset=5, flags=SYN only, no
//! options) doesn't need the teacher's general-purpose option-list
//! builder.

use std::net::Ipv4Addr;

use crate::checksum::tcp_checksum_v4;

pub const TCP_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0b0000_0001);
    pub const SYN: TcpFlags = TcpFlags(0b0000_0010);
    pub const RST: TcpFlags = TcpFlags(0b0000_0100);
    pub const PSH: TcpFlags = TcpFlags(0b0000_1000);
    pub const ACK: TcpFlags = TcpFlags(0b0001_0000);
    pub const URG: TcpFlags = TcpFlags(0b0010_0000);

    pub const fn empty() -> Self {
        TcpFlags(0)
    }

    pub fn combine(&self, other: TcpFlags) -> Self {
        TcpFlags(self.0 | other.0)
    }

    pub fn has(&self, flag: TcpFlags) -> bool {
        (self.0 & flag.0) != 0
    }

    /// SYN|ACK per spec §4.3's classification rule.
    pub fn is_syn_ack(&self) -> bool {
        self.has(TcpFlags::SYN) && self.has(TcpFlags::ACK)
    }

    pub fn is_rst(&self) -> bool {
        self.has(TcpFlags::RST)
    }
}

/// A parsed TCP header view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub sequence: u32,
    pub ack: u32,
    pub data_offset: u8,
    pub flags: TcpFlags,
}

/// Parse a TCP header, validating `data_offset >= 5` and bounds.
pub fn parse_tcp(data: &[u8]) -> Option<TcpHeader> {
    if data.len() < TCP_HEADER_LEN {
        return None;
    }
    let data_offset = data[12] >> 4;
    if data_offset < 5 {
        return None;
    }
    let header_len = data_offset as usize * 4;
    if data.len() < header_len {
        return None;
    }
    Some(TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        sequence: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        flags: TcpFlags(data[13]),
    })
}

/// Build a bit-exact 20-byte SYN segment: data offset=5, flags=SYN only,
/// window=65535, urgent=0, checksum over pseudo-header + segment.
pub fn build_syn_segment(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    sequence: u32,
) -> [u8; TCP_HEADER_LEN] {
    let mut segment = [0u8; TCP_HEADER_LEN];
    segment[0..2].copy_from_slice(&src_port.to_be_bytes());
    segment[2..4].copy_from_slice(&dst_port.to_be_bytes());
    segment[4..8].copy_from_slice(&sequence.to_be_bytes());
    segment[8..12].copy_from_slice(&0u32.to_be_bytes()); // ack
    segment[12] = 5 << 4; // data offset=5, reserved=0
    segment[13] = TcpFlags::SYN.0;
    segment[14..16].copy_from_slice(&65535u16.to_be_bytes()); // window
    segment[18..20].copy_from_slice(&0u16.to_be_bytes()); // urgent ptr

    let checksum = tcp_checksum_v4(src, dst, &segment);
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());
    segment
}
