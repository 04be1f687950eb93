/// Transport seam between the negotiation logic and a WebRTC stack
///
/// `PeerLink` and `PeerConnectionManager` only talk to these traits. The
/// `webrtc` crate backs them in production (`rtc.rs`); tests use recording
/// fakes. Asynchronous notifications from the stack (ICE candidates,
/// connection state, channels, remote tracks) arrive as `PeerEvent`s on the
/// manager's event channel, tagged with the remote peer id.
use crate::domain::shared::value_objects::MemberId;
use crate::domain::signaling::{IceCandidate, SessionDescription};
use crate::infrastructure::media::{LocalTrack, TrackKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("no local description after negotiation step")]
    MissingLocalDescription,

    #[error("data channel {0} is not open")]
    ChannelNotOpen(String),

    #[error("no video sender on this connection")]
    NoVideoSender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States the connection never recovers from
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

/// Who created a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrigin {
    Local,
    Remote,
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

pub enum TransportEvent {
    /// Locally gathered candidate to send to the peer
    IceCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    RemoteTrack {
        track_id: String,
        stream_id: String,
        kind: TrackKind,
    },
    ChannelOpen {
        channel: Arc<dyn DataChannel>,
        origin: ChannelOrigin,
    },
    ChannelMessage {
        label: String,
        message: ChannelMessage,
    },
    ChannelClosed {
        label: String,
    },
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            TransportEvent::ConnectionState(s) => {
                f.debug_tuple("ConnectionState").field(s).finish()
            }
            TransportEvent::RemoteTrack {
                track_id,
                stream_id,
                kind,
            } => f
                .debug_struct("RemoteTrack")
                .field("track_id", track_id)
                .field("stream_id", stream_id)
                .field("kind", kind)
                .finish(),
            TransportEvent::ChannelOpen { channel, origin } => f
                .debug_struct("ChannelOpen")
                .field("label", &channel.label())
                .field("origin", origin)
                .finish(),
            TransportEvent::ChannelMessage { label, message } => f
                .debug_struct("ChannelMessage")
                .field("label", label)
                .field("message", message)
                .finish(),
            TransportEvent::ChannelClosed { label } => {
                f.debug_struct("ChannelClosed").field("label", label).finish()
            }
        }
    }
}

#[derive(Debug)]
pub struct PeerEvent {
    pub peer_id: MemberId,
    pub event: TransportEvent,
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError>;

    /// Swap the outgoing video track on the existing sender, without
    /// renegotiation
    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Open an ordered, reliable channel. It is reported through
    /// `TransportEvent::ChannelOpen` once usable.
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &MemberId,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, TransportError>;
}
