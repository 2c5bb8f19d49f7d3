//! Lock-free MPMC allocator for TCP source ports.
//!
//! No teacher file allocates source ports as a standalone concern — the
//! teacher's scanners pick an ephemeral port ad hoc per packet. This
//! module is new, grounded in the teacher's lock-free/atomic concurrency
//! idioms and generalized from `other_examples/.../Phobos/socket.rs`'s
//! `SocketPool` round-robin `AtomicUsize` cursor.
//!
//! Two interchangeable backends are provided, selected once at
//! construction via the `SR_PORT_ALLOCATOR` environment variable:
//! `"cas"` selects the CAS-scan allocator, anything else (including
//! unset) selects the queue-based allocator.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use prtip_core::{Error, Result};

/// Typical ephemeral range used when the caller does not specify one.
pub const DEFAULT_PORT_RANGE: Range<u16> = 32768..61000;

const MIN_BACKOFF: Duration = Duration::from_micros(1);
const MAX_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind {
    CasScan,
    Queue,
}

impl AllocatorKind {
    /// Read `SR_PORT_ALLOCATOR` once: `"cas"` (case-insensitive) selects
    /// the CAS-scan allocator, anything else (including unset) selects
    /// the queue-based allocator.
    pub fn from_env() -> Self {
        match std::env::var("SR_PORT_ALLOCATOR") {
            Ok(v) if v.eq_ignore_ascii_case("cas") => AllocatorKind::CasScan,
            _ => AllocatorKind::Queue,
        }
    }
}

/// Exponential backoff with a bounded cap, shared by both backends'
/// `reserve` retry loops.
async fn backoff_wait(current: &mut Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = sleep(*current) => {
            *current = (*current * 2).min(MAX_BACKOFF);
            Ok(())
        }
    }
}

/// Round-robin cursor plus a per-slot `AtomicBool` reserved flag; reserve
/// advances the cursor and CASes the first free slot it finds on a full
/// linear scan of the ring.
struct CasScanAllocator {
    base_port: u16,
    slots: Vec<AtomicBool>,
    cursor: AtomicUsize,
    free_hint: AtomicUsize,
}

impl CasScanAllocator {
    fn new(range: Range<u16>) -> Self {
        let len = (range.end - range.start) as usize;
        Self {
            base_port: range.start,
            slots: (0..len).map(|_| AtomicBool::new(false)).collect(),
            cursor: AtomicUsize::new(0),
            free_hint: AtomicUsize::new(len),
        }
    }

    async fn reserve(&self, cancel: &CancellationToken) -> Result<u16> {
        let len = self.slots.len();
        let mut backoff = MIN_BACKOFF;
        loop {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            for offset in 0..len {
                let idx = (start + offset) % len;
                if self.slots[idx]
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    self.free_hint.fetch_sub(1, Ordering::Relaxed);
                    let port = self.base_port + idx as u16;
                    trace!(port, "port allocator: reserved (cas-scan)");
                    return Ok(port);
                }
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            backoff_wait(&mut backoff, cancel).await?;
        }
    }

    fn release(&self, port: u16) {
        if port < self.base_port {
            return;
        }
        let idx = (port - self.base_port) as usize;
        if idx >= self.slots.len() {
            return;
        }
        if self.slots[idx]
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.free_hint.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn free(&self) -> usize {
        self.free_hint.load(Ordering::Relaxed)
    }

    fn available(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.load(Ordering::Relaxed))
            .count()
    }
}

/// Bounded pre-populated queue of free ports, plus a per-slot
/// `AtomicBool` reserved flag used to guard against double-enqueue bugs
/// on release.
struct QueueAllocator {
    base_port: u16,
    slots: Vec<AtomicBool>,
    queue: ArrayQueue<u16>,
}

impl QueueAllocator {
    fn new(range: Range<u16>) -> Self {
        let len = (range.end - range.start) as usize;
        let queue = ArrayQueue::new(len);
        for port in range.clone() {
            let _ = queue.push(port);
        }
        Self {
            base_port: range.start,
            slots: (0..len).map(|_| AtomicBool::new(false)).collect(),
            queue,
        }
    }

    async fn reserve(&self, cancel: &CancellationToken) -> Result<u16> {
        let mut backoff = MIN_BACKOFF;
        loop {
            if let Some(port) = self.queue.pop() {
                let idx = (port - self.base_port) as usize;
                if self.slots[idx]
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    trace!(port, "port allocator: reserved (queue)");
                    return Ok(port);
                }
                // Lost a race with a stray double-enqueue; the port is
                // already reserved elsewhere, try again.
                continue;
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            backoff_wait(&mut backoff, cancel).await?;
        }
    }

    fn release(&self, port: u16) {
        if port < self.base_port {
            return;
        }
        let idx = (port - self.base_port) as usize;
        if idx >= self.slots.len() {
            return;
        }
        if self.slots[idx]
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            // Non-blocking; silently dropped if the queue is unexpectedly
            // full (would only happen on a release-without-reserve bug).
            let _ = self.queue.push(port);
        }
    }

    fn free(&self) -> usize {
        self.queue.len()
    }

    fn available(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.load(Ordering::Relaxed))
            .count()
    }
}

enum Backend {
    CasScan(CasScanAllocator),
    Queue(QueueAllocator),
}

/// Fixed-range, MPMC, lock-free allocator for TCP source ports.
pub struct PortAllocator {
    backend: Backend,
}

impl PortAllocator {
    /// Construct with the default ephemeral range, backend chosen from
    /// `SR_PORT_ALLOCATOR`.
    pub fn new() -> Self {
        Self::with_range(DEFAULT_PORT_RANGE)
    }

    pub fn with_range(range: Range<u16>) -> Self {
        Self::with_kind(range, AllocatorKind::from_env())
    }

    pub fn with_kind(range: Range<u16>, kind: AllocatorKind) -> Self {
        debug!(?kind, start = range.start, end = range.end, "port allocator: constructed");
        let backend = match kind {
            AllocatorKind::CasScan => Backend::CasScan(CasScanAllocator::new(range)),
            AllocatorKind::Queue => Backend::Queue(QueueAllocator::new(range)),
        };
        Self { backend }
    }

    /// Reserve a port not currently reserved. Fails only on cancellation.
    pub async fn reserve(&self, cancel: &CancellationToken) -> Result<u16> {
        match &self.backend {
            Backend::CasScan(a) => a.reserve(cancel).await,
            Backend::Queue(a) => a.reserve(cancel).await,
        }
    }

    /// Mark a port free. Idempotent; silently no-ops on out-of-range
    /// input.
    pub fn release(&self, port: u16) {
        match &self.backend {
            Backend::CasScan(a) => a.release(port),
            Backend::Queue(a) => a.release(port),
        }
    }

    /// O(1) approximate free count.
    pub fn free(&self) -> usize {
        match &self.backend {
            Backend::CasScan(a) => a.free(),
            Backend::Queue(a) => a.free(),
        }
    }

    /// O(n) exact free count.
    pub fn available(&self) -> usize {
        match &self.backend {
            Backend::CasScan(a) => a.available(),
            Backend::Queue(a) => a.available(),
        }
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tiny_range() -> Range<u16> {
        40000..40004
    }

    #[tokio::test]
    async fn test_cas_scan_reserve_release_roundtrip() {
        let alloc = PortAllocator::with_kind(tiny_range(), AllocatorKind::CasScan);
        let cancel = CancellationToken::new();
        let port = alloc.reserve(&cancel).await.unwrap();
        assert!((40000..40004).contains(&port));
        assert_eq!(alloc.available(), 3);
        alloc.release(port);
        assert_eq!(alloc.available(), 4);
    }

    #[tokio::test]
    async fn test_queue_reserve_release_roundtrip() {
        let alloc = PortAllocator::with_kind(tiny_range(), AllocatorKind::Queue);
        let cancel = CancellationToken::new();
        let port = alloc.reserve(&cancel).await.unwrap();
        assert!((40000..40004).contains(&port));
        assert_eq!(alloc.available(), 3);
        alloc.release(port);
        assert_eq!(alloc.available(), 4);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let alloc = PortAllocator::with_kind(tiny_range(), AllocatorKind::CasScan);
        let cancel = CancellationToken::new();
        let port = alloc.reserve(&cancel).await.unwrap();
        alloc.release(port);
        alloc.release(port); // no panic, no double-free accounting
        assert_eq!(alloc.available(), 4);
    }

    #[tokio::test]
    async fn test_release_out_of_range_is_noop() {
        let alloc = PortAllocator::with_kind(tiny_range(), AllocatorKind::CasScan);
        alloc.release(1); // below range
        alloc.release(65000); // above range
        assert_eq!(alloc.available(), 4);
    }

    #[tokio::test]
    async fn test_exhaustion_then_cancel_fails_reserve() {
        let alloc = Arc::new(PortAllocator::with_kind(1000..1001, AllocatorKind::Queue));
        let cancel = CancellationToken::new();
        let first = alloc.reserve(&cancel).await.unwrap();
        assert_eq!(first, 1000);

        let alloc2 = alloc.clone();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { alloc2.reserve(&cancel2).await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_uniqueness_under_concurrent_reserve() {
        let alloc = Arc::new(PortAllocator::with_kind(50000..50064, AllocatorKind::CasScan));
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for _ in 0..64 {
            let alloc = alloc.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(
                async move { alloc.reserve(&cancel).await.unwrap() },
            ));
        }
        let mut ports = Vec::new();
        for h in handles {
            ports.push(h.await.unwrap());
        }
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 64, "every reserved port must be unique");
        assert_eq!(alloc.available(), 0);
    }

    #[test]
    fn test_allocator_kind_from_env_defaults_to_queue() {
        std::env::remove_var("SR_PORT_ALLOCATOR");
        assert_eq!(AllocatorKind::from_env(), AllocatorKind::Queue);
    }

    #[test]
    fn test_allocator_kind_from_env_cas() {
        std::env::set_var("SR_PORT_ALLOCATOR", "cas");
        assert_eq!(AllocatorKind::from_env(), AllocatorKind::CasScan);
        std::env::remove_var("SR_PORT_ALLOCATOR");
    }
}
