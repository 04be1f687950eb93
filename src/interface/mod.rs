//! Interface layer - External interfaces
//!
//! This layer handles:
//! - The WebSocket signaling relay
//! - Health and Prometheus endpoints

pub mod api;
