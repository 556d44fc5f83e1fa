// file: src/logging/mod.rs
// version: 1.1.0
// guid: i9j0k1l2-m3n4-5678-9012-345678ijklmn

//! Logging system for the provisioning toolchain

pub mod logger;

pub use logger::{init_json_logger, init_logger, with_phase_span};
