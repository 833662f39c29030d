//! CLI support
//!
//! Configuration loading for the agent binary.

pub mod config;
