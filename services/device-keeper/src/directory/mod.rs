//! Directory module
//!
//! Interfaces to the device registry: where connection targets come from
//! and where forwarding addresses go.

pub mod adapter;
pub mod http;
pub mod memory;
