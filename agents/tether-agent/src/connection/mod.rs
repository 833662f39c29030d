//! Connection module
//!
//! This module handles all communication with the collector, including
//! certificate authentication, pooled transports, health checks, and
//! retry/reconnect logic.

pub mod certificate;
pub mod client;
pub mod factory;
pub mod health;
pub mod retry;
