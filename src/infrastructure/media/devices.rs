/// Media device acquisition
///
/// Capture itself (camera frames, microphone audio, screen pixels) belongs
/// to the embedding application; a device hands out tracks the application
/// then feeds with encoded samples.
use super::track::{LocalStream, LocalTrack, TrackSource};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// Source of local tracks
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Camera and microphone
    async fn user_media(&self) -> Result<LocalStream, MediaError>;

    /// A fresh camera video track, used to leave screen sharing
    async fn camera_video(&self, stream_id: String) -> Result<Arc<LocalTrack>, MediaError>;

    /// A screen capture video track
    async fn display_media(&self, stream_id: String) -> Result<Arc<LocalTrack>, MediaError>;
}

/// Devices that always succeed and produce unattached tracks
#[derive(Debug, Default, Clone)]
pub struct SyntheticMediaDevices;

#[async_trait]
impl MediaDevices for SyntheticMediaDevices {
    async fn user_media(&self) -> Result<LocalStream, MediaError> {
        let stream_id = Uuid::new_v4().to_string();
        let audio = LocalTrack::new(TrackSource::Microphone, &stream_id);
        let video = LocalTrack::new(TrackSource::Camera, &stream_id);
        info!("Acquired synthetic camera and microphone (stream {})", stream_id);
        Ok(LocalStream::new(stream_id, audio, video))
    }

    async fn camera_video(&self, stream_id: String) -> Result<Arc<LocalTrack>, MediaError> {
        Ok(LocalTrack::new(TrackSource::Camera, &stream_id))
    }

    async fn display_media(&self, stream_id: String) -> Result<Arc<LocalTrack>, MediaError> {
        Ok(LocalTrack::new(TrackSource::Screen, &stream_id))
    }
}
