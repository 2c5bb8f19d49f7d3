//! Shared data model: probe targets, results, and per-probe errors.
//!
//! These types are produced and consumed by every engine in
//! `prtip-scanner`; none of the engines own a private copy.

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What kind of probe a [`Target`] requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeMode {
    /// ICMP Echo liveness probe.
    Icmp,
    /// TCP port-reachability probe (SYN or connect).
    Tcp,
}

/// An immutable probe request.
///
/// `port` is required when `mode == ProbeMode::Tcp` and ignored for
/// `ProbeMode::Icmp`; engines that filter a target list to their own mode
/// never dereference `port` for an ICMP target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub host: Ipv4Addr,
    pub port: Option<u16>,
    pub mode: ProbeMode,
}

impl Target {
    pub fn icmp(host: Ipv4Addr) -> Self {
        Self {
            host,
            port: None,
            mode: ProbeMode::Icmp,
        }
    }

    pub fn tcp(host: Ipv4Addr, port: u16) -> Self {
        Self {
            host,
            port: Some(port),
            mode: ProbeMode::Tcp,
        }
    }

    /// Stable identifier for a TCP probe within one scan: `"host:port"`.
    ///
    /// Panics if called on an ICMP-mode target; callers only ever form a
    /// target key after filtering to TCP mode.
    pub fn key(&self) -> String {
        format!(
            "{}:{}",
            self.host,
            self.port.expect("target_key requires a TCP target")
        )
    }
}

/// Per-target error recorded on a [`ProbeResult`].
///
/// Distinct from [`crate::error::Error`]: this is never fatal to the
/// scan, it is information attached to exactly one outcome.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeError {
    #[error("port closed")]
    PortClosed,
    #[error("scan timed out")]
    ScanTimedOut,
    #[error("invalid ICMP destination")]
    InvalidIcmpDestination,
    #[error("send failed")]
    SendFailed,
    #[error("probe cancelled")]
    Cancelled,
}

/// A probe outcome. Exactly one is produced per input [`Target`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub target: Target,
    pub available: bool,
    pub response_time: Duration,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// ICMP only: 0 or 100. Always 0 for TCP targets.
    pub packet_loss: u8,
    pub error: Option<ProbeError>,
}

impl ProbeResult {
    /// A fresh, not-yet-answered provisional result: `available=false`,
    /// `packet_loss=100`, `first_seen=last_seen=now`. Callers upgrade this
    /// in place once a reply (or timeout) is classified.
    pub fn provisional(target: Target, now: DateTime<Utc>) -> Self {
        Self {
            target,
            available: false,
            response_time: Duration::ZERO,
            first_seen: now,
            last_seen: now,
            packet_loss: 100,
            error: None,
        }
    }

    pub fn mark_available(&mut self, now: DateTime<Utc>) {
        self.available = true;
        self.packet_loss = 0;
        self.last_seen = now;
        self.response_time = (now - self.first_seen)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.error = None;
    }

    pub fn mark_error(&mut self, now: DateTime<Utc>, error: ProbeError) {
        self.available = false;
        self.last_seen = now;
        self.response_time = (now - self.first_seen)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_key() {
        let t = Target::tcp("198.51.100.20".parse().unwrap(), 443);
        assert_eq!(t.key(), "198.51.100.20:443");
    }

    #[test]
    fn test_icmp_target_has_no_port() {
        let t = Target::icmp("10.0.0.1".parse().unwrap());
        assert_eq!(t.port, None);
        assert_eq!(t.mode, ProbeMode::Icmp);
    }

    #[test]
    fn test_provisional_result_invariants() {
        let now = Utc::now();
        let t = Target::icmp("10.0.0.1".parse().unwrap());
        let r = ProbeResult::provisional(t, now);
        assert!(!r.available);
        assert_eq!(r.packet_loss, 100);
        assert_eq!(r.first_seen, r.last_seen);
        assert!(r.error.is_none());
    }

    #[test]
    fn test_mark_available_clears_error_and_sets_rtt() {
        let first = Utc::now();
        let t = Target::tcp("198.51.100.20".parse().unwrap(), 443);
        let mut r = ProbeResult::provisional(t, first);
        let later = first + chrono::Duration::milliseconds(12);
        r.mark_available(later);
        assert!(r.available);
        assert_eq!(r.packet_loss, 0);
        assert!(r.response_time > Duration::ZERO);
        assert!(r.error.is_none());
    }

    #[test]
    fn test_mark_error_keeps_available_false() {
        let now = Utc::now();
        let t = Target::tcp("198.51.100.20".parse().unwrap(), 443);
        let mut r = ProbeResult::provisional(t, now);
        r.mark_error(now, ProbeError::PortClosed);
        assert!(!r.available);
        assert_eq!(r.error, Some(ProbeError::PortClosed));
    }
}
