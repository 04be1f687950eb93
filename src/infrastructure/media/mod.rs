//! Local media: tracks and the devices that produce them

pub mod devices;
pub mod track;

pub use devices::{MediaDevices, MediaError, SyntheticMediaDevices};
pub use track::{LocalStream, LocalTrack, TrackKind, TrackSource};

#[cfg(test)]
pub use devices::MockMediaDevices;
