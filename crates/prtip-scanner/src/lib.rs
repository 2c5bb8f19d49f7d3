//! Probe engines for IPv4 reachability/port-discovery scans.
//!
//! This crate provides the scanning engines themselves — ICMP liveness
//! sweeping, half-open TCP SYN scanning, and TCP connect scanning — plus
//! the lock-free source-port allocator the SYN scanner draws from. It
//! does not own scan planning, result storage, or output formatting;
//! those are a caller's concern.
//!
//! # Architecture
//!
//! - [`scanner`]: the [`Scanner`] trait every engine implements
//! - [`port_allocator`]: lock-free MPMC source-port allocator
//! - [`icmp_sweeper`]: ICMP Echo liveness sweeper
//! - [`syn_scanner`]: half-open TCP SYN scanner (Linux only)
//! - [`tcp_connect`]: TCP connect() sweeper, the portable fallback
//!
//! # Example
//!
//! ```no_run
//! use prtip_scanner::{Scanner, TcpConnectConfig, TcpConnectSweeper};
//! use prtip_core::Target;
//! use tokio_util::sync::CancellationToken;
//! use futures::StreamExt;
//!
//! # async fn example() {
//! let sweeper = TcpConnectSweeper::new(TcpConnectConfig::default());
//! let targets = vec![Target::tcp("198.51.100.20".parse().unwrap(), 443)];
//! let mut results = Scanner::scan(&sweeper, CancellationToken::new(), targets);
//! while let Some(result) = results.next().await {
//!     println!("{:?}", result);
//! }
//! # }
//! ```

pub mod icmp_sweeper;
pub mod port_allocator;
pub mod scanner;
pub mod syn_scanner;
pub mod tcp_connect;

pub use icmp_sweeper::{IcmpSweeper, IcmpSweeperConfig};
pub use port_allocator::{AllocatorKind, PortAllocator, DEFAULT_PORT_RANGE};
pub use scanner::Scanner;
pub use syn_scanner::{SynScanner, SynScannerConfig};
pub use tcp_connect::{TcpConnectConfig, TcpConnectSweeper};
