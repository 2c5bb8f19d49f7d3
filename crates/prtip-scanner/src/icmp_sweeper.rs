//! ICMP Echo liveness sweeper.
//!
//! Structurally grounded in the teacher's deleted `icmp_monitor.rs`
//! pattern (sender/receiver/completion split, `AtomicBool` running flag,
//! a shared mutex over per-scan state), but implementing new Echo/
//! Echo-Reply identifier-correlation logic — the teacher's file handled
//! ICMP *error* delivery for other scanners, not liveness sweeping.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use prtip_core::{ProbeError, ProbeMode, ProbeResult, Target};
use prtip_network::{IcmpDatagramSocket, RawIcmpSendSocket};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const BATCH_INTERVAL: Duration = Duration::from_millis(10);
const MAX_BATCH_SIZE: u32 = 50;
const MIN_BATCH_SIZE: u32 = 5;
const RECV_READ_DEADLINE: Duration = Duration::from_millis(100);
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ECHO_PAYLOAD: &[u8] = b"ping";

/// Construction parameters for [`IcmpSweeper`].
#[derive(Debug, Clone)]
pub struct IcmpSweeperConfig {
    pub timeout: Duration,
    pub rate_limit: u32,
}

impl Default for IcmpSweeperConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            rate_limit: 1000,
        }
    }
}

/// Compute the 10 ms-batch packet count for a given packets/second rate
/// limit: `max(1, rate_limit / (1000 / 10ms))`, capped at
/// [`MAX_BATCH_SIZE`].
fn packets_per_interval(rate_limit: u32) -> u32 {
    let per_interval = rate_limit / 100; // 1000ms / 10ms = 100 intervals/sec
    per_interval.max(1).min(MAX_BATCH_SIZE)
}

fn build_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + ECHO_PAYLOAD.len());
    packet.push(ICMP_ECHO_REQUEST);
    packet.push(0); // code
    packet.push(0); // checksum hi (filled below)
    packet.push(0); // checksum lo
    packet.extend_from_slice(&identifier.to_be_bytes());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(ECHO_PAYLOAD);
    let checksum = prtip_network::ones_complement_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

struct EchoReply {
    identifier: u16,
}

fn parse_echo_reply(data: &[u8]) -> Option<EchoReply> {
    if data.len() < 8 || data[0] != ICMP_ECHO_REPLY {
        return None;
    }
    let identifier = u16::from_be_bytes([data[4], data[5]]);
    Some(EchoReply { identifier })
}

struct SharedState {
    results: HashMap<Ipv4Addr, ProbeResult>,
    invalid_destinations: HashSet<Ipv4Addr>,
}

/// Determines IPv4 host liveness by sending ICMP Echo and matching
/// Echo-Reply by this instance's 16-bit identifier.
#[derive(Clone)]
pub struct IcmpSweeper {
    config: IcmpSweeperConfig,
    identifier: u16,
    eagain_count: Arc<AtomicU32>,
    callback: Option<Arc<dyn Fn(ProbeResult) + Send + Sync>>,
    stop_token: CancellationToken,
}

impl IcmpSweeper {
    pub fn new(config: IcmpSweeperConfig) -> Self {
        static SEED: AtomicU64 = AtomicU64::new(0);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0)
            ^ SEED.fetch_add(1, Ordering::Relaxed);
        let identifier = (nanos & 0xFFFF) as u16;
        debug!(identifier, rate_limit = config.rate_limit, "icmp sweeper: constructed");
        Self {
            config,
            identifier,
            eagain_count: Arc::new(AtomicU32::new(0)),
            callback: None,
            stop_token: CancellationToken::new(),
        }
    }

    /// Register a callback invoked as soon as a target's Result becomes
    /// definitive, in addition to the end-of-scan drain.
    pub fn set_result_callback<F>(&mut self, callback: F)
    where
        F: Fn(ProbeResult) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
    }

    pub async fn scan(
        &self,
        cancel: CancellationToken,
        targets: Vec<Target>,
    ) -> mpsc::Receiver<ProbeResult> {
        let icmp_targets: Vec<Target> = targets
            .into_iter()
            .filter(|t| t.mode == ProbeMode::Icmp)
            .collect();

        let (tx, rx) = mpsc::channel(icmp_targets.len().max(1));
        if icmp_targets.is_empty() {
            return rx;
        }

        let now = Utc::now();
        let order: Vec<Ipv4Addr> = icmp_targets.iter().map(|t| t.host).collect();
        let shared = Arc::new(Mutex::new(SharedState {
            results: icmp_targets
                .iter()
                .map(|t| (t.host, ProbeResult::provisional(*t, now)))
                .collect(),
            invalid_destinations: HashSet::new(),
        }));

        let send_socket = match RawIcmpSendSocket::new() {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!(error = %e, "icmp sweeper: failed to open raw send socket");
                for host in &order {
                    if let Some(result) = shared.lock().results.get(host).cloned() {
                        let _ = tx.send(result).await;
                    }
                }
                return rx;
            }
        };
        let recv_socket = match IcmpDatagramSocket::bind_any() {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!(error = %e, "icmp sweeper: failed to bind receive endpoint");
                for host in &order {
                    if let Some(result) = shared.lock().results.get(host).cloned() {
                        let _ = tx.send(result).await;
                    }
                }
                return rx;
            }
        };

        let sender_done = CancellationToken::new();

        let sender = self.spawn_sender(
            cancel.clone(),
            sender_done.clone(),
            send_socket,
            recv_socket.clone(),
            shared.clone(),
            icmp_targets.iter().map(|t| t.host).collect(),
        );
        let receiver_cancel = CancellationToken::new();
        let receiver = self.spawn_receiver(
            receiver_cancel.clone(),
            recv_socket,
            shared.clone(),
            self.identifier,
            self.callback.clone(),
        );

        let timeout = self.config.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = sender => {}
                _ = cancel.cancelled() => {}
            }
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = cancel.cancelled() => {}
            }
            receiver_cancel.cancel();
            let _ = receiver.await;

            let mut guard = shared.lock();
            for host in order {
                let result = guard.results.remove(&host).unwrap_or_else(|| {
                    let mut r = ProbeResult::provisional(Target::icmp(host), Utc::now());
                    r.mark_error(Utc::now(), ProbeError::ScanTimedOut);
                    r
                });
                let result = if result.error.is_none() && !result.available {
                    let mut r = result;
                    r.mark_error(Utc::now(), ProbeError::ScanTimedOut);
                    r
                } else {
                    result
                };
                let _ = tx.send(result).await;
            }
            debug!("icmp sweeper: scan finished");
        });

        rx
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_sender(
        &self,
        cancel: CancellationToken,
        _sender_done: CancellationToken,
        send_socket: Arc<RawIcmpSendSocket>,
        fallback_socket: Arc<IcmpDatagramSocket>,
        shared: Arc<Mutex<SharedState>>,
        hosts: Vec<Ipv4Addr>,
    ) -> tokio::task::JoinHandle<()> {
        let rate_limit = self.config.rate_limit;
        let identifier = self.identifier;
        let eagain_count = self.eagain_count.clone();

        tokio::spawn(async move {
            let base_batch = packets_per_interval(rate_limit);
            let packet = build_echo_request(identifier, 1);
            let mut ticker = interval(BATCH_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut cursor = 0usize;
            while cursor < hosts.len() {
                if cancel.is_cancelled() {
                    break;
                }
                ticker.tick().await;

                let pressure = eagain_count.swap(0, Ordering::Relaxed) > 0;
                let batch_size = if pressure {
                    (base_batch / 2).max(MIN_BATCH_SIZE)
                } else {
                    base_batch
                } as usize;

                let end = (cursor + batch_size).min(hosts.len());
                for host in &hosts[cursor..end] {
                    if shared.lock().invalid_destinations.contains(host) {
                        continue;
                    }
                    send_one(
                        *host,
                        &packet,
                        &send_socket,
                        &fallback_socket,
                        &shared,
                        &eagain_count,
                    );
                }
                cursor = end;
            }
            trace!("icmp sweeper: sender finished");
        })
    }

    fn spawn_receiver(
        &self,
        cancel: CancellationToken,
        recv_socket: Arc<IcmpDatagramSocket>,
        shared: Arc<Mutex<SharedState>>,
        identifier: u16,
        callback: Option<Arc<dyn Fn(ProbeResult) + Send + Sync>>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let read = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECV_READ_DEADLINE) => None,
                    result = recv_once(&recv_socket, &mut buf) => result,
                };
                let Some((size, src)) = read else {
                    continue;
                };
                let Some(reply) = parse_echo_reply(&buf[..size]) else {
                    continue;
                };
                if reply.identifier != identifier {
                    continue;
                }
                let mut guard = shared.lock();
                if let Some(result) = guard.results.get_mut(&src) {
                    if !result.available {
                        result.mark_available(Utc::now());
                        if let Some(cb) = &callback {
                            cb(result.clone());
                        }
                    }
                }
            }
            trace!("icmp sweeper: receiver finished");
        })
    }
}

async fn recv_once(socket: &IcmpDatagramSocket, buf: &mut [u8]) -> Option<(usize, Ipv4Addr)> {
    loop {
        match socket.recv_from(buf) {
            Ok(result) => return Some(result),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Err(_) => return None,
        }
    }
}

fn send_one(
    host: Ipv4Addr,
    packet: &[u8],
    send_socket: &RawIcmpSendSocket,
    fallback_socket: &IcmpDatagramSocket,
    shared: &Mutex<SharedState>,
    eagain_count: &AtomicU32,
) {
    let now = Utc::now();
    {
        let mut guard = shared.lock();
        let entry = guard
            .results
            .entry(host)
            .or_insert_with(|| ProbeResult::provisional(Target::icmp(host), now));
        entry.first_seen = now;
        entry.last_seen = now;
    }

    match send_socket.send_to(packet, host) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            eagain_count.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) if prtip_network::raw_send::is_invalid_destination(&e) => {
            match fallback_socket.send_to(packet, host) {
                Ok(_) => {}
                Err(fallback_err)
                    if prtip_network::raw_send::is_invalid_destination(&fallback_err) =>
                {
                    mark_invalid(host, shared);
                }
                Err(_) => mark_invalid(host, shared),
            }
        }
        Err(_) => {
            // Recorded implicitly: no reply will ever arrive for this
            // target and it times out normally at finalisation.
        }
    }
}

impl crate::scanner::Scanner for IcmpSweeper {
    fn scan(
        &self,
        cancel: CancellationToken,
        targets: Vec<Target>,
    ) -> futures::stream::BoxStream<'static, ProbeResult> {
        let this = self.clone();
        let combined = crate::scanner::merge_cancellation(cancel, this.stop_token.clone());
        let (tx, rx) = mpsc::channel(targets.len().max(1));
        tokio::spawn(async move {
            let mut inner = this.scan(combined, targets).await;
            while let Some(result) = inner.recv().await {
                if tx.send(result).await.is_err() {
                    break;
                }
            }
        });
        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
    }

    fn stop(&self) -> prtip_core::Result<()> {
        self.stop_token.cancel();
        debug!("icmp sweeper: stopped");
        Ok(())
    }
}

fn mark_invalid(host: Ipv4Addr, shared: &Mutex<SharedState>) {
    let mut guard = shared.lock();
    guard.invalid_destinations.insert(host);
    let now = Utc::now();
    if let Some(result) = guard.results.get_mut(&host) {
        result.mark_error(now, ProbeError::InvalidIcmpDestination);
    }
    warn!(%host, "icmp sweeper: marked invalid destination");
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- rate pacing -----------------------------------------------

    #[test]
    fn test_packets_per_interval_default_rate() {
        assert_eq!(packets_per_interval(1000), 10);
    }

    #[test]
    fn test_packets_per_interval_clamps_to_one() {
        assert_eq!(packets_per_interval(50), 1);
    }

    #[test]
    fn test_packets_per_interval_caps_at_max() {
        assert_eq!(packets_per_interval(100_000), MAX_BATCH_SIZE);
    }

    // --- echo request/reply framing ----------------------------------

    #[test]
    fn test_build_echo_request_fields() {
        let packet = build_echo_request(0xABCD, 1);
        assert_eq!(packet[0], ICMP_ECHO_REQUEST);
        assert_eq!(packet[1], 0);
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 0xABCD);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 1);
    }

    #[test]
    fn test_parse_echo_reply_matches_identifier() {
        let mut reply = vec![ICMP_ECHO_REPLY, 0, 0, 0];
        reply.extend_from_slice(&0x1234u16.to_be_bytes());
        reply.extend_from_slice(&1u16.to_be_bytes());
        let parsed = parse_echo_reply(&reply).unwrap();
        assert_eq!(parsed.identifier, 0x1234);
    }

    #[test]
    fn test_parse_echo_reply_rejects_non_reply_type() {
        let mut packet = vec![ICMP_ECHO_REQUEST, 0, 0, 0];
        packet.extend_from_slice(&0u16.to_be_bytes());
        packet.extend_from_slice(&0u16.to_be_bytes());
        assert!(parse_echo_reply(&packet).is_none());
    }

    #[test]
    fn test_parse_echo_reply_rejects_short_packet() {
        assert!(parse_echo_reply(&[0, 0]).is_none());
    }

    // --- scan-level behaviour -----------------------------------------

    #[tokio::test]
    async fn test_scan_with_no_icmp_targets_closes_immediately() {
        let sweeper = IcmpSweeper::new(IcmpSweeperConfig::default());
        let cancel = CancellationToken::new();
        let targets = vec![Target::tcp("127.0.0.1".parse().unwrap(), 80)];
        let mut rx = sweeper.scan(cancel, targets).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_destination_set_is_shared() {
        let shared = Arc::new(Mutex::new(SharedState {
            results: HashMap::new(),
            invalid_destinations: HashSet::new(),
        }));
        let host: Ipv4Addr = "10.255.255.254".parse().unwrap();
        mark_invalid(host, &shared);
        let guard = shared.lock();
        assert!(guard.invalid_destinations.contains(&host));
        assert_eq!(
            guard.results.get(&host).unwrap().error,
            Some(ProbeError::InvalidIcmpDestination)
        );
    }
}
