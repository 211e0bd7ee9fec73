//! CLI support module
//!
//! Configuration loading and logging setup for the keeper binary.

pub mod config;
pub mod logging;
