//! The common interface every probe engine exposes.
//!
//! The teacher has no single `Scanner` trait — each of its scanners
//! (`TcpConnectScanner`, `StealthScanner`, ...) is called directly by
//! `ScanScheduler` with its own bespoke method names. This crate
//! standardizes on one trait so a caller can hold any engine behind a
//! `Box<dyn Scanner>` without matching on scan type.

use futures::stream::BoxStream;
use prtip_core::{ProbeResult, Result, Target};
use tokio_util::sync::CancellationToken;

/// A probe engine: turns a batch of [`Target`]s into a stream of
/// [`ProbeResult`]s, one per input target.
pub trait Scanner {
    /// Start a scan. The returned stream closes once every target has
    /// produced a definitive result (or the scan is cancelled).
    fn scan(&self, cancel: CancellationToken, targets: Vec<Target>) -> BoxStream<'static, ProbeResult>;

    /// Request early termination of any scan currently in flight on this
    /// instance, in addition to whatever `CancellationToken` the caller
    /// passed to `scan`. Idempotent.
    fn stop(&self) -> Result<()>;
}

/// Combine a caller-supplied cancellation token with an engine's own
/// `stop()` token: the merged token fires as soon as either does.
pub(crate) fn merge_cancellation(caller: CancellationToken, own: CancellationToken) -> CancellationToken {
    let merged = CancellationToken::new();
    let merged_clone = merged.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = caller.cancelled() => {}
            _ = own.cancelled() => {}
        }
        merged_clone.cancel();
    });
    merged
}
