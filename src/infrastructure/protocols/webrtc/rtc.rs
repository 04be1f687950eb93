/// `webrtc` crate implementation of the transport traits
use super::transport::{
    ChannelMessage, ChannelOrigin, ConnectionState, DataChannel, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEventSender, TransportError, TransportEvent,
};
use crate::domain::shared::value_objects::MemberId;
use crate::domain::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::infrastructure::media::{LocalTrack, TrackKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Builds peer connections sharing one media engine, configured with a
/// single STUN server and no TURN fallback.
pub struct WebRtcPeerFactory {
    api: API,
    stun_url: String,
}

impl WebRtcPeerFactory {
    pub fn new(stun_url: impl Into<String>) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            stun_url: stun_url.into(),
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![self.stun_url.clone()],
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        peer_id: &MemberId,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let pc = Arc::new(self.api.new_peer_connection(self.configuration()).await?);

        let (tx, peer) = (events.clone(), peer_id.clone());
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let (tx, peer) = (tx.clone(), peer.clone());
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete for {}", peer);
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent {
                            peer_id: peer,
                            event: TransportEvent::IceCandidate(from_rtc_candidate(init)),
                        });
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate for {}: {}", peer, e),
                }
            })
        }));

        let (tx, peer) = (events.clone(), peer_id.clone());
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let (tx, peer) = (tx.clone(), peer.clone());
            Box::pin(async move {
                let _ = tx.send(PeerEvent {
                    peer_id: peer,
                    event: TransportEvent::ConnectionState(map_connection_state(state)),
                });
            })
        }));

        let (tx, peer) = (events.clone(), peer_id.clone());
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let (tx, peer) = (tx.clone(), peer.clone());
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        _ => TrackKind::Video,
                    };
                    let _ = tx.send(PeerEvent {
                        peer_id: peer,
                        event: TransportEvent::RemoteTrack {
                            track_id: track.id(),
                            stream_id: track.stream_id(),
                            kind,
                        },
                    });
                })
            },
        ));

        let (tx, peer) = (events.clone(), peer_id.clone());
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let (tx, peer) = (tx.clone(), peer.clone());
            Box::pin(async move {
                debug!("Peer {} announced data channel {}", peer, dc.label());
                wire_channel(&dc, ChannelOrigin::Remote, tx, peer);
            })
        }));

        info!("Created peer connection for {}", peer_id);
        Ok(Arc::new(WebRtcPeerConnection {
            pc,
            peer_id: peer_id.clone(),
            events,
            video_sender: Mutex::new(None),
        }))
    }
}

pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    peer_id: MemberId,
    events: PeerEventSender,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError> {
        let rtp: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
        let sender = self.pc.add_track(rtp).await?;

        if track.kind() == TrackKind::Video {
            *self.video_sender.lock().await = Some(sender.clone());
        }

        // RTCP has to be drained for the interceptors to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError> {
        let sender = self
            .video_sender
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NoVideoSender)?;
        let rtp: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
        sender.replace_track(Some(rtp)).await?;
        debug!("Replaced video track for {} with {}", self.peer_id, track.id());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let dc = self
            .pc
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        wire_channel(&dc, ChannelOrigin::Local, self.events.clone(), self.peer_id.clone());
        Ok(Arc::new(WebRtcDataChannel { dc }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}

pub struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen(self.label()));
        }
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen(self.label()));
        }
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.dc.close().await?;
        Ok(())
    }
}

/// Forward open/message/close notifications of a channel to the manager
fn wire_channel(
    dc: &Arc<RTCDataChannel>,
    origin: ChannelOrigin,
    events: PeerEventSender,
    peer_id: MemberId,
) {
    let label = dc.label().to_string();

    let weak = Arc::downgrade(dc);
    let (tx, peer) = (events.clone(), peer_id.clone());
    dc.on_open(Box::new(move || {
        let (tx, peer, weak) = (tx.clone(), peer.clone(), weak.clone());
        Box::pin(async move {
            if let Some(dc) = weak.upgrade() {
                let _ = tx.send(PeerEvent {
                    peer_id: peer,
                    event: TransportEvent::ChannelOpen {
                        channel: Arc::new(WebRtcDataChannel { dc }),
                        origin,
                    },
                });
            }
        })
    }));

    let (tx, peer, message_label) = (events.clone(), peer_id.clone(), label.clone());
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let (tx, peer, label) = (tx.clone(), peer.clone(), message_label.clone());
        Box::pin(async move {
            let message = if msg.is_string {
                ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelMessage::Binary(msg.data)
            };
            let _ = tx.send(PeerEvent {
                peer_id: peer,
                event: TransportEvent::ChannelMessage { label, message },
            });
        })
    }));

    let (tx, peer) = (events, peer_id);
    dc.on_close(Box::new(move || {
        let (tx, peer, label) = (tx.clone(), peer.clone(), label.clone());
        Box::pin(async move {
            let _ = tx.send(PeerEvent {
                peer_id: peer,
                event: TransportEvent::ChannelClosed { label },
            });
        })
    }));
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let rtc = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}
