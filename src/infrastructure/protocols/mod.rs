//! Protocol implementations

pub mod signaling;
pub mod webrtc;

pub use signaling::{SignalingConnection, SignalingError};
