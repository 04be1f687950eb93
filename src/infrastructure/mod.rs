//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Local media tracks and device access
//! - The WebRTC peer connection stack
//! - The WebSocket signaling client

pub mod media;
pub mod protocols;
