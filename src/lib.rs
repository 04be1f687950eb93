//! RoomLink - peer-to-peer rooms over WebRTC
//!
//! A small signaling relay plus the client side that negotiates one direct
//! peer connection per room member, with file transfer and a shared
//! whiteboard over data channels.

pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
