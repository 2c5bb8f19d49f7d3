//! Core types and error handling for the reachability/port-discovery
//! engine.
//!
//! # Examples
//!
//! ```
//! use prtip_core::cidr::expand_cidr;
//!
//! let hosts = expand_cidr("10.0.0.0/30").unwrap();
//! assert_eq!(hosts.len(), 2); // network and broadcast elided
//! ```

pub mod cidr;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ProbeError, ProbeMode, ProbeResult, Target};
