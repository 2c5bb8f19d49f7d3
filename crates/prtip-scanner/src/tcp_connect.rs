//! TCP connect sweeper: reachability via a standard connect() handshake,
//! the portable fallback used when raw sockets are unavailable.
//!
//! Restructured from the teacher's per-port `tokio::spawn` + `Semaphore`
//! pattern (`scan_ports`/`scan_ports_with_progress`) into the fixed
//! worker-pool-of-N draining a bounded channel that spec §4.4 specifies.
//! Error classification (`ConnectionRefused` → closed, `PermissionDenied`
//! → filtered) is kept from the teacher's `attempt_connect`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use prtip_core::{ProbeError, ProbeMode, ProbeResult, Target};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Construction parameters for [`TcpConnectSweeper`].
#[derive(Debug, Clone)]
pub struct TcpConnectConfig {
    pub timeout: Duration,
    pub concurrency: usize,
}

impl Default for TcpConnectConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            concurrency: 500,
        }
    }
}

/// TCP port reachability via connect(), usable without raw-socket
/// privileges.
#[derive(Clone)]
pub struct TcpConnectSweeper {
    config: TcpConnectConfig,
    stop_token: CancellationToken,
}

impl TcpConnectSweeper {
    pub fn new(config: TcpConnectConfig) -> Self {
        debug!(concurrency = config.concurrency, "tcp connect sweeper: constructed");
        Self {
            config,
            stop_token: CancellationToken::new(),
        }
    }

    pub async fn scan(
        &self,
        cancel: CancellationToken,
        targets: Vec<Target>,
    ) -> mpsc::Receiver<ProbeResult> {
        let tcp_targets: Vec<Target> = targets
            .into_iter()
            .filter(|t| t.mode == ProbeMode::Tcp)
            .collect();

        let (out_tx, out_rx) = mpsc::channel(tcp_targets.len().max(1));
        if tcp_targets.is_empty() {
            return out_rx;
        }

        let concurrency = self.config.concurrency.max(1).min(tcp_targets.len());
        let timeout_dur = self.config.timeout;
        let queue_capacity = (2 * self.config.concurrency).max(1);

        let (work_tx, work_rx) = mpsc::channel::<(usize, Target)>(queue_capacity);
        let work_rx = Arc::new(AsyncMutex::new(work_rx));
        // Workers report indexed results here; the final task reassembles
        // input order from this channel once every worker has exited.
        let (collect_tx, mut collect_rx) = mpsc::channel::<(usize, ProbeResult)>(tcp_targets.len());

        // Producer: feeds the bounded work queue in input order; stops
        // early on cancellation so no new probe starts once cancelled.
        {
            let cancel = cancel.clone();
            let targets_indexed: Vec<(usize, Target)> =
                tcp_targets.iter().copied().enumerate().collect();
            tokio::spawn(async move {
                for item in targets_indexed {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        send = work_tx.send(item) => {
                            if send.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        let mut workers = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let work_rx = work_rx.clone();
            let cancel = cancel.clone();
            let collect_tx = collect_tx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let item = {
                        let mut rx = work_rx.lock().await;
                        rx.recv().await
                    };
                    let Some((index, target)) = item else {
                        break;
                    };
                    let result = probe_one(target, timeout_dur, &cancel).await;
                    if collect_tx.send((index, result)).await.is_err() {
                        break;
                    }
                }
                trace!(worker_id, "tcp connect sweeper: worker finished");
            }));
        }
        // Drop this function's own handle so `collect_rx` closes once
        // every worker's clone is dropped, not before.
        drop(collect_tx);

        tokio::spawn(async move {
            let mut slots: Vec<Option<ProbeResult>> = vec![None; tcp_targets.len()];
            while let Some((index, result)) = collect_rx.recv().await {
                if index < slots.len() {
                    slots[index] = Some(result);
                }
            }
            for worker in workers {
                let _ = worker.await;
            }
            for (target, slot) in tcp_targets.into_iter().zip(slots.into_iter()) {
                let result = slot.unwrap_or_else(|| {
                    let mut r = ProbeResult::provisional(target, Utc::now());
                    r.mark_error(Utc::now(), ProbeError::Cancelled);
                    r
                });
                if out_tx.send(result).await.is_err() {
                    break;
                }
            }
            debug!("tcp connect sweeper: scan finished");
        });

        out_rx
    }
}

async fn probe_one(target: Target, timeout_dur: Duration, cancel: &CancellationToken) -> ProbeResult {
    let now = Utc::now();
    let mut result = ProbeResult::provisional(target, now);
    let addr = SocketAddr::new(target.host.into(), target.port.unwrap_or(0));

    let connect = TcpStream::connect(addr);
    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(ConnectOutcome::Cancelled),
        r = timeout(timeout_dur, connect) => Ok(r),
    };

    match outcome {
        Err(ConnectOutcome::Cancelled) => {
            result.mark_error(Utc::now(), ProbeError::Cancelled);
        }
        Ok(Ok(Ok(_stream))) => {
            result.mark_available(Utc::now());
        }
        Ok(Ok(Err(e))) => {
            let now = Utc::now();
            match e.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    result.mark_error(now, ProbeError::PortClosed);
                }
                std::io::ErrorKind::PermissionDenied => {
                    warn!(host = %target.host, "tcp connect sweeper: permission denied");
                    result.mark_error(now, ProbeError::SendFailed);
                }
                _ => {
                    result.mark_error(now, ProbeError::SendFailed);
                }
            }
        }
        Ok(Err(_elapsed)) => {
            result.mark_error(Utc::now(), ProbeError::ScanTimedOut);
        }
    }
    result
}

enum ConnectOutcome {
    Cancelled,
}

impl crate::scanner::Scanner for TcpConnectSweeper {
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
        debug!("tcp connect sweeper: stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_closed_port_yields_one_result() {
        let sweeper = TcpConnectSweeper::new(TcpConnectConfig {
            timeout: Duration::from_millis(300),
            concurrency: 4,
        });
        let cancel = CancellationToken::new();
        let targets = vec![Target::tcp("127.0.0.1".parse().unwrap(), 1)];
        let mut rx = sweeper.scan(cancel, targets).await;
        let result = rx.recv().await.unwrap();
        assert!(!result.available);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_scan_preserves_input_order() {
        let sweeper = TcpConnectSweeper::new(TcpConnectConfig {
            timeout: Duration::from_millis(300),
            concurrency: 8,
        });
        let cancel = CancellationToken::new();
        let ports = [1u16, 2, 3, 4, 5];
        let targets: Vec<Target> = ports
            .iter()
            .map(|&p| Target::tcp("127.0.0.1".parse().unwrap(), p))
            .collect();
        let mut rx = sweeper.scan(cancel, targets).await;
        let mut seen = Vec::new();
        while let Some(result) = rx.recv().await {
            seen.push(result.target.port.unwrap());
        }
        assert_eq!(seen, ports.to_vec());
    }

    #[tokio::test]
    async fn test_scan_with_no_tcp_targets_closes_immediately() {
        let sweeper = TcpConnectSweeper::new(TcpConnectConfig::default());
        let cancel = CancellationToken::new();
        let targets = vec![Target::icmp("10.0.0.1".parse().unwrap())];
        let mut rx = sweeper.scan(cancel, targets).await;
        assert!(rx.recv().await.is_none());
    }
}
