//! Domain layer - rooms, signaling messages and the per-peer protocols
//!
//! Everything here is synchronous and transport-agnostic.

pub mod file_transfer;
pub mod media;
pub mod negotiation;
pub mod room;
pub mod shared;
pub mod signaling;
pub mod whiteboard;
