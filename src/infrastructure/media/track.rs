/// Local media tracks
///
/// A `LocalTrack` wraps the RTP track handed to every peer connection. The
/// same handle is shared by all peers, so muting or stopping it is seen by
/// all of them at once.
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Capture source behind a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

pub struct LocalTrack {
    id: String,
    source: TrackSource,
    rtp: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

impl LocalTrack {
    pub fn new(source: TrackSource, stream_id: &str) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        let mime_type = match source.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        ));
        let (ended, _) = watch::channel(false);

        Arc::new(Self {
            id,
            source,
            rtp,
            enabled: AtomicBool::new(true),
            ended,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtp.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// End the track. Used both for local stop and for the capture source
    /// going away (e.g. the user ends a screen share from the system UI).
    pub fn stop(&self) {
        self.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Resolves once the track has ended
    pub async fn ended(&self) {
        let mut rx = self.ended.subscribe();
        // Sender lives in self, so wait_for only fails if self is dropped.
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// Push one encoded media sample. Disabled or ended tracks send nothing,
    /// which remote peers see as silence or a frozen/black picture.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> webrtc::error::Result<()> {
        if !self.is_enabled() || self.is_ended() {
            debug!("Dropping sample on inactive track {}", self.id);
            return Ok(());
        }
        self.rtp
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Camera + microphone pair acquired together
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    pub audio: Arc<LocalTrack>,
    pub video: Arc<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, audio: Arc<LocalTrack>, video: Arc<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            audio,
            video,
        }
    }

    pub fn tracks(&self) -> [Arc<LocalTrack>; 2] {
        [self.audio.clone(), self.video.clone()]
    }

    pub fn stop(&self) {
        self.audio.stop();
        self.video.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_kind_follows_source() {
        let mic = LocalTrack::new(TrackSource::Microphone, "s");
        let screen = LocalTrack::new(TrackSource::Screen, "s");
        assert_eq!(mic.kind(), TrackKind::Audio);
        assert_eq!(screen.kind(), TrackKind::Video);
        assert_ne!(mic.id(), screen.id());
    }

    #[test]
    fn test_enabled_flag_toggles_in_place() {
        let track = LocalTrack::new(TrackSource::Camera, "s");
        assert!(track.is_enabled());
        track.set_enabled(false);
        assert!(!track.is_enabled());
        assert!(!track.is_ended());
    }

    #[tokio::test]
    async fn test_ended_resolves_after_stop() {
        let track = LocalTrack::new(TrackSource::Screen, "s");
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };

        track.stop();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(track.is_ended());
    }

    #[tokio::test]
    async fn test_muted_track_drops_samples() {
        let track = LocalTrack::new(TrackSource::Microphone, "s");
        track.set_enabled(false);
        track
            .write_sample(Bytes::from_static(&[0u8; 4]), Duration::from_millis(20))
            .await
            .unwrap();
    }
}
