//! Recording fakes for the transport traits

use super::transport::{
    ChannelMessage, DataChannel, PeerConnection, PeerConnectionFactory, PeerEventSender,
    TransportError,
};
use crate::domain::shared::value_objects::MemberId;
use crate::domain::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::infrastructure::media::{LocalTrack, TrackKind};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AddTrack(String),
    ReplaceVideoTrack(String),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddIceCandidate(String),
    CreateDataChannel(String),
    Close,
}

pub struct FakeDataChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<ChannelMessage>>,
    /// When set, each binary send consumes one permit
    gate: Option<Semaphore>,
}

impl FakeDataChannel {
    fn with_state(label: &str, open: bool, gate: Option<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(open),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            gate,
        })
    }

    pub fn new(label: &str) -> Arc<Self> {
        Self::with_state(label, false, None)
    }

    pub fn open(label: &str) -> Arc<Self> {
        Self::with_state(label, true, None)
    }

    /// Open channel whose binary sends block after `chunks` have gone out
    pub fn stalled(label: &str, chunks: usize) -> Arc<Self> {
        Self::with_state(label, true, Some(Semaphore::new(chunks)))
    }

    /// Let `chunks` more binary sends through a stalled channel
    pub fn release(&self, chunks: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(chunks);
        }
    }

    pub fn sent(&self) -> Vec<ChannelMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen(self.label.clone()));
        }
        self.sent.lock().unwrap().push(ChannelMessage::Text(text));
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| TransportError::ChannelNotOpen(self.label.clone()))?
                .forget();
        }
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen(self.label.clone()));
        }
        self.sent.lock().unwrap().push(ChannelMessage::Binary(data));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeerConnection {
    calls: Mutex<Vec<Call>>,
    has_video: AtomicBool,
}

impl FakePeerConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError> {
        if track.kind() == TrackKind::Video {
            self.has_video.store(true, Ordering::SeqCst);
        }
        self.record(Call::AddTrack(track.id().to_string()));
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<(), TransportError> {
        if !self.has_video.load(Ordering::SeqCst) {
            return Err(TransportError::NoVideoSender);
        }
        self.record(Call::ReplaceVideoTrack(track.id().to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateOffer);
        Ok(SessionDescription::offer("v=0 fake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::answer("v=0 fake-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.record(Call::SetLocal(desc.kind));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(Call::SetRemote(desc.kind));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.record(Call::AddIceCandidate(candidate.candidate));
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        self.record(Call::CreateDataChannel(label.to_string()));
        Ok(FakeDataChannel::new(label))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.record(Call::Close);
        Ok(())
    }
}

/// Hands out `FakePeerConnection`s and remembers them by peer
#[derive(Default)]
pub struct FakePeerFactory {
    created: Mutex<Vec<(MemberId, Arc<FakePeerConnection>)>>,
}

impl FakePeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Most recent connection created for `peer`
    pub fn connection(&self, peer: &MemberId) -> Option<Arc<FakePeerConnection>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == peer)
            .map(|(_, pc)| pc.clone())
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        peer_id: &MemberId,
        _events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let pc = FakePeerConnection::new();
        self.created
            .lock()
            .unwrap()
            .push((peer_id.clone(), pc.clone()));
        Ok(pc)
    }
}
