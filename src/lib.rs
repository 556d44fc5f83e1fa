// file: src/lib.rs
// version: 3.0.0
// guid: d82472d1-7f0f-4eb4-b0a3-6e1547103eb4

//! # Syntropy node provisioning
//!
//! Turns an operator's "create a node" request into a bootable USB device:
//! an Ubuntu Server install image followed by a CIDATA partition carrying a
//! cloud-init seed with the node's identity, TLS material and network layout.
//!
//! The pieces, in the order the [`pipeline`] drives them:
//!
//! - [`config::intent`] validates the request
//! - [`identity`] loads or generates the owner, community and node keys
//! - [`image`] resolves a cached or freshly downloaded install image
//! - [`seed`] renders `user-data`, `meta-data` and `network-config`
//! - [`platform`] enumerates, writes, partitions and formats the device
//! - [`record`] writes the node record once the device is released

pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod image;
pub mod logging;
pub mod pipeline;
pub mod platform;
pub mod record;
pub mod seed;
pub mod utils;

pub use error::{OperatorReport, ProvisionError, Result};

/// Version information for the toolchain
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
