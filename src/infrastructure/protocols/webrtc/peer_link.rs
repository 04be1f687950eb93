/// Per-remote-peer link
///
/// Couples one `PeerConnection` with the negotiation state machine and the
/// data channels opened toward that peer (the shared whiteboard channel and
/// one channel per file transfer).
use super::manager::InternalEvent;
use super::transport::{
    ChannelMessage, ChannelOrigin, DataChannel, PeerConnection, TransportError,
};
use crate::domain::file_transfer::{
    channel_label, parse_channel_label, Direction, FileReceiver, OutgoingTransfer, ReceivedFile,
    ReceiverUpdate, TransferError,
};
use crate::domain::negotiation::{Negotiation, NegotiationState};
use crate::domain::shared::error::DomainError;
use crate::domain::shared::value_objects::{MemberId, TransferId};
use crate::domain::signaling::{IceCandidate, SessionDescription};
use crate::domain::whiteboard::DrawEvent;
use crate::infrastructure::media::LocalTrack;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

pub const WHITEBOARD_LABEL: &str = "whiteboard";

#[derive(Debug, Error)]
pub enum LinkError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<TransportError> for TransferError {
    fn from(err: TransportError) -> Self {
        TransferError::Channel(err.to_string())
    }
}

#[derive(Debug, Clone)]
enum FileSource {
    Path(PathBuf),
    Memory(Bytes),
}

/// A file queued for sending, readable once per peer
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    name: String,
    size: u64,
    source: FileSource,
}

impl OutgoingFile {
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self {
            name,
            size: metadata.len(),
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            source: FileSource::Memory(data),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    async fn reader(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>, TransferError> {
        match &self.source {
            FileSource::Path(path) => Ok(Box::new(tokio::fs::File::open(path).await?)),
            FileSource::Memory(data) => Ok(Box::new(std::io::Cursor::new(data.clone()))),
        }
    }
}

/// Something a data channel message produced for the application
#[derive(Debug)]
pub enum LinkOutput {
    Stroke(DrawEvent),
    Started {
        transfer_id: TransferId,
        name: String,
        size: u64,
    },
    Progress {
        transfer_id: TransferId,
        direction: Direction,
        percent: u8,
    },
    Received(ReceivedFile),
    Failed {
        transfer_id: TransferId,
        error: TransferError,
    },
}

pub struct PeerLink {
    negotiation: Negotiation,
    connection: Arc<dyn PeerConnection>,
    whiteboard: Option<Arc<dyn DataChannel>>,
    file_channels: HashMap<TransferId, Arc<dyn DataChannel>>,
    pending_files: HashMap<TransferId, OutgoingFile>,
    sending: HashMap<TransferId, AbortHandle>,
    receiver: FileReceiver,
    remote_stream: Option<String>,
}

impl PeerLink {
    /// Wrap a fresh connection and attach the local tracks to it
    pub async fn connect(
        peer_id: MemberId,
        connection: Arc<dyn PeerConnection>,
        tracks: &[Arc<LocalTrack>],
    ) -> Result<Self, LinkError> {
        for track in tracks {
            connection.add_track(track.clone()).await?;
        }

        Ok(Self {
            negotiation: Negotiation::new(peer_id),
            connection,
            whiteboard: None,
            file_channels: HashMap::new(),
            pending_files: HashMap::new(),
            sending: HashMap::new(),
            receiver: FileReceiver::new(),
            remote_stream: None,
        })
    }

    pub fn peer_id(&self) -> &MemberId {
        self.negotiation.peer_id()
    }

    pub fn state(&self) -> NegotiationState {
        self.negotiation.state()
    }

    pub fn negotiation(&self) -> &Negotiation {
        &self.negotiation
    }

    pub fn remote_stream(&self) -> Option<&str> {
        self.remote_stream.as_deref()
    }

    pub fn set_remote_stream(&mut self, stream_id: impl Into<String>) {
        self.remote_stream = Some(stream_id.into());
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.negotiation.is_expired(now, timeout)
    }

    /// Offerer path: open the whiteboard channel, then create and apply
    /// the offer. The caller sends the returned description.
    pub async fn start_offer(&mut self) -> Result<SessionDescription, LinkError> {
        self.negotiation.begin_offer()?;

        let channel = self.connection.create_data_channel(WHITEBOARD_LABEL).await?;
        self.whiteboard = Some(channel);

        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(offer.clone()).await?;
        debug!("Created offer for {}", self.peer_id());
        Ok(offer)
    }

    /// Answerer path. The link counts as connected once the answer is set
    /// locally.
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, LinkError> {
        self.negotiation.begin_answer()?;
        self.connection.set_remote_description(offer).await?;
        self.flush_candidates().await?;

        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        self.negotiation.complete()?;
        debug!("Answered offer from {}", self.peer_id());
        Ok(answer)
    }

    pub async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), LinkError> {
        self.negotiation.expect_answer()?;
        self.connection.set_remote_description(answer).await?;
        self.flush_candidates().await?;
        self.negotiation.complete()?;
        info!("Negotiation with {} complete", self.peer_id());
        Ok(())
    }

    async fn flush_candidates(&mut self) -> Result<(), LinkError> {
        let pending = self.negotiation.remote_description_applied()?;
        if !pending.is_empty() {
            debug!(
                "Applying {} buffered candidates for {}",
                pending.len(),
                self.peer_id()
            );
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
        Ok(())
    }

    /// Apply a remote candidate now, or queue it until the remote
    /// description is set
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if let Some(candidate) = self.negotiation.accept_candidate(candidate) {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            warn!("Failed to add ICE candidate from {}: {}", self.peer_id(), e);
        }
    }

    pub async fn replace_video_track(&self, track: Arc<LocalTrack>) -> Result<(), LinkError> {
        self.connection.replace_video_track(track).await?;
        Ok(())
    }

    /// Open a dedicated channel for `file`; streaming starts when the
    /// channel reports open.
    pub async fn send_file(&mut self, file: OutgoingFile) -> Result<TransferId, LinkError> {
        let id = TransferId::new();
        self.connection.create_data_channel(&channel_label(id)).await?;
        info!(
            "Queued {} ({} bytes) for {} as transfer {}",
            file.name(),
            file.size(),
            self.peer_id(),
            id
        );
        self.pending_files.insert(id, file);
        Ok(id)
    }

    pub fn channel_opened(
        &mut self,
        channel: Arc<dyn DataChannel>,
        origin: ChannelOrigin,
        internal: &mpsc::UnboundedSender<InternalEvent>,
    ) {
        let label = channel.label();
        if label == WHITEBOARD_LABEL {
            debug!("Whiteboard channel with {} open", self.peer_id());
            self.whiteboard = Some(channel);
            return;
        }

        let Some(id) = parse_channel_label(&label) else {
            debug!("Ignoring unknown channel {} from {}", label, self.peer_id());
            return;
        };

        match origin {
            ChannelOrigin::Remote => {
                self.receiver.open(id);
            }
            ChannelOrigin::Local => {
                let Some(file) = self.pending_files.remove(&id) else {
                    warn!("Channel {} opened without a queued file", label);
                    return;
                };
                let task = tokio::spawn(stream_file(
                    channel.clone(),
                    file,
                    id,
                    self.peer_id().clone(),
                    internal.clone(),
                ));
                self.sending.insert(id, task.abort_handle());
            }
        }
        self.file_channels.insert(id, channel);
    }

    pub async fn handle_channel_message(
        &mut self,
        label: &str,
        message: ChannelMessage,
    ) -> Option<LinkOutput> {
        if label == WHITEBOARD_LABEL {
            return match message {
                ChannelMessage::Text(text) => match DrawEvent::from_json(&text) {
                    Ok(event) => Some(LinkOutput::Stroke(event)),
                    Err(e) => {
                        warn!("Malformed stroke from {}: {}", self.peer_id(), e);
                        None
                    }
                },
                ChannelMessage::Binary(_) => {
                    warn!("Unexpected binary whiteboard frame from {}", self.peer_id());
                    None
                }
            };
        }

        let id = parse_channel_label(label)?;
        match message {
            ChannelMessage::Binary(chunk) => {
                self.receiver
                    .handle_binary(id, chunk)
                    .map(|percent| LinkOutput::Progress {
                        transfer_id: id,
                        direction: Direction::Incoming,
                        percent,
                    })
            }
            ChannelMessage::Text(text) => match self.receiver.handle_text(id, &text) {
                Ok(ReceiverUpdate::Started { name, size }) => Some(LinkOutput::Started {
                    transfer_id: id,
                    name,
                    size,
                }),
                Ok(ReceiverUpdate::Completed(file)) => {
                    info!(
                        "Received {} ({} bytes) from {}",
                        file.name,
                        file.len(),
                        self.peer_id()
                    );
                    self.close_file_channel(id).await;
                    Some(LinkOutput::Received(file))
                }
                Err(error) => {
                    warn!("Transfer {} from {} failed: {}", id, self.peer_id(), error);
                    self.receiver.discard(id);
                    self.close_file_channel(id).await;
                    Some(LinkOutput::Failed {
                        transfer_id: id,
                        error,
                    })
                }
            },
        }
    }

    /// A channel went away. An incoming transfer that had not completed is
    /// reported as failed.
    pub fn channel_closed(&mut self, label: &str) -> Option<LinkOutput> {
        if label == WHITEBOARD_LABEL {
            self.whiteboard = None;
            return None;
        }

        let id = parse_channel_label(label)?;
        self.file_channels.remove(&id);
        self.sending.remove(&id);
        if self.receiver.discard(id) {
            return Some(LinkOutput::Failed {
                transfer_id: id,
                error: TransferError::Channel(format!("{label} closed before completion")),
            });
        }
        None
    }

    /// Send a stroke if the whiteboard channel is open; otherwise the
    /// segment is skipped.
    pub async fn send_stroke(&self, event: &DrawEvent) -> bool {
        let Some(channel) = self.whiteboard.as_ref().filter(|c| c.is_open()) else {
            return false;
        };
        let text = match event.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode stroke: {}", e);
                return false;
            }
        };
        match channel.send_text(text).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send stroke to {}: {}", self.peer_id(), e);
                false
            }
        }
    }

    async fn close_file_channel(&mut self, id: TransferId) {
        if let Some(channel) = self.file_channels.remove(&id) {
            if let Err(e) = channel.close().await {
                debug!("Closing channel for transfer {} failed: {}", id, e);
            }
        }
    }

    /// Tear the link down. In-flight transfers are dropped, not drained.
    pub async fn close(&mut self) {
        self.negotiation.close();
        for (_, task) in self.sending.drain() {
            task.abort();
        }
        self.pending_files.clear();
        self.file_channels.clear();
        self.receiver.clear();
        self.whiteboard = None;

        if let Err(e) = self.connection.close().await {
            warn!("Error closing connection to {}: {}", self.peer_id(), e);
        }
        info!("Closed link to {}", self.peer_id());
    }
}

/// Stream `file` over `channel`: the start frame, sequential chunks, then
/// the completion frame carrying size and checksum
async fn stream_file(
    channel: Arc<dyn DataChannel>,
    file: OutgoingFile,
    transfer_id: TransferId,
    peer_id: MemberId,
    internal: mpsc::UnboundedSender<InternalEvent>,
) {
    let name = file.name().to_string();
    let result = send_chunks(&channel, &file, transfer_id, &peer_id, &internal).await;
    let _ = internal.send(InternalEvent::SendFinished {
        peer_id,
        transfer_id,
        name,
        result,
    });
}

async fn send_chunks(
    channel: &Arc<dyn DataChannel>,
    file: &OutgoingFile,
    transfer_id: TransferId,
    peer_id: &MemberId,
    internal: &mpsc::UnboundedSender<InternalEvent>,
) -> Result<u64, TransferError> {
    let mut transfer = OutgoingTransfer::new(transfer_id, file.name(), file.size());
    let mut reader = file.reader().await?;

    channel.send_text(transfer.start_frame().to_json()?).await?;

    while !transfer.is_finished() {
        let mut chunk = vec![0u8; transfer.next_chunk_len()];
        reader.read_exact(&mut chunk).await?;
        let percent = transfer.record_chunk(&chunk);
        channel.send_binary(Bytes::from(chunk)).await?;
        let _ = internal.send(InternalEvent::SendProgress {
            peer_id: peer_id.clone(),
            transfer_id,
            percent,
        });
    }

    let sent = transfer.offset();
    channel
        .send_text(transfer.completion_frame().to_json()?)
        .await?;
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::file_transfer::{ControlFrame, CHUNK_SIZE};
    use crate::domain::signaling::SdpType;
    use crate::infrastructure::media::TrackSource;
    use crate::infrastructure::protocols::webrtc::testing::{
        Call, FakeDataChannel, FakePeerConnection,
    };

    async fn link(peer: &str) -> (PeerLink, Arc<FakePeerConnection>) {
        let connection = FakePeerConnection::new();
        let tracks = [
            LocalTrack::new(TrackSource::Microphone, "local"),
            LocalTrack::new(TrackSource::Camera, "local"),
        ];
        let link = PeerLink::connect(MemberId::from(peer), connection.clone(), &tracks)
            .await
            .unwrap();
        (link, connection)
    }

    #[tokio::test]
    async fn test_offer_creates_whiteboard_channel_first() {
        let (mut link, connection) = link("b").await;

        let offer = link.start_offer().await.unwrap();

        assert_eq!(offer.kind, SdpType::Offer);
        assert_eq!(link.state(), NegotiationState::Negotiating);
        let calls = connection.calls();
        let channel_at = calls
            .iter()
            .position(|c| *c == Call::CreateDataChannel(WHITEBOARD_LABEL.to_string()))
            .unwrap();
        let offer_at = calls.iter().position(|c| *c == Call::CreateOffer).unwrap();
        assert!(channel_at < offer_at);
    }

    #[tokio::test]
    async fn test_early_candidates_applied_after_remote_description() {
        let (mut link, connection) = link("b").await;

        link.add_remote_candidate(IceCandidate::new("c1")).await;
        link.add_remote_candidate(IceCandidate::new("c2")).await;
        assert_eq!(link.negotiation().pending_candidates(), 2);

        link.accept_offer(SessionDescription::offer("v=0")).await.unwrap();
        link.add_remote_candidate(IceCandidate::new("c3")).await;

        let applied: Vec<_> = connection
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AddIceCandidate(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(applied, vec!["c1", "c2", "c3"]);
        assert_eq!(link.state(), NegotiationState::Connected);
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_rejected() {
        let (mut link, _) = link("b").await;
        let err = link
            .apply_answer(SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Domain(_)));
    }

    #[tokio::test]
    async fn test_stroke_skipped_until_channel_open() {
        let (mut link, _) = link("b").await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let event = DrawEvent::from_json(
            r##"{"x0":1,"y0":1,"x1":5,"y1":5,"color":"#000000","lineWidth":2}"##,
        )
        .unwrap();

        assert!(!link.send_stroke(&event).await);

        let channel = FakeDataChannel::open(WHITEBOARD_LABEL);
        link.channel_opened(channel.clone(), ChannelOrigin::Remote, &tx);
        assert!(link.send_stroke(&event).await);
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_send_file_streams_after_channel_open() {
        let (mut link, connection) = link("b").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let payload: Vec<u8> = (0..CHUNK_SIZE + 10).map(|i| i as u8).collect();

        let id = link
            .send_file(OutgoingFile::from_bytes("notes.txt", payload.clone()))
            .await
            .unwrap();
        assert!(connection
            .calls()
            .contains(&Call::CreateDataChannel(channel_label(id))));

        let channel = FakeDataChannel::open(&channel_label(id));
        link.channel_opened(channel.clone(), ChannelOrigin::Local, &tx);

        let mut progress = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                InternalEvent::SendProgress { percent, .. } => progress.push(percent),
                InternalEvent::SendFinished { result, .. } => {
                    assert_eq!(result.unwrap(), payload.len() as u64);
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(progress.len(), 2);
        assert_eq!(progress.last(), Some(&100));

        let sent = channel.sent();
        assert_eq!(sent.len(), 4);
        assert!(matches!(&sent[1], ChannelMessage::Binary(b) if b.len() == CHUNK_SIZE));
        assert!(matches!(&sent[2], ChannelMessage::Binary(b) if b.len() == 10));
        match &sent[3] {
            ChannelMessage::Text(text) => {
                let frame: ControlFrame = serde_json::from_str(text).unwrap();
                assert!(matches!(
                    frame,
                    ControlFrame::FileComplete { name, size: Some(size), sha256: Some(_) }
                        if name == "notes.txt" && size == payload.len() as u64
                ));
            }
            other => panic!("expected completion frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_incoming_transfer_completes_and_closes_channel() {
        let (mut link, _) = link("b").await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = TransferId::new();
        let label = channel_label(id);
        let channel = FakeDataChannel::open(&label);
        link.channel_opened(channel.clone(), ChannelOrigin::Remote, &tx);

        let started = link
            .handle_channel_message(
                &label,
                ChannelMessage::Text(r#"{"type":"file-start","name":"a.txt","size":5}"#.into()),
            )
            .await;
        assert!(matches!(started, Some(LinkOutput::Started { size: 5, .. })));

        let progress = link
            .handle_channel_message(&label, ChannelMessage::Binary(Bytes::from_static(b"hello")))
            .await;
        assert!(matches!(progress, Some(LinkOutput::Progress { percent: 100, .. })));

        let done = link
            .handle_channel_message(
                &label,
                ChannelMessage::Text(r#"{"type":"file-complete","name":"a.txt","size":5}"#.into()),
            )
            .await;
        assert!(matches!(done, Some(LinkOutput::Received(f)) if f.data.as_ref() == b"hello"));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_channel_closed_mid_transfer_reports_failure() {
        let (mut link, _) = link("b").await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = TransferId::new();
        let label = channel_label(id);
        link.channel_opened(FakeDataChannel::open(&label), ChannelOrigin::Remote, &tx);
        link.handle_channel_message(&label, ChannelMessage::Binary(Bytes::from_static(b"par")))
            .await;

        let output = link.channel_closed(&label);
        assert!(matches!(output, Some(LinkOutput::Failed { transfer_id, .. }) if transfer_id == id));
    }

    #[tokio::test]
    async fn test_close_stops_stream_mid_file() {
        let (mut link, _) = link("b").await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = link
            .send_file(OutgoingFile::from_bytes("big.bin", vec![1u8; CHUNK_SIZE * 4]))
            .await
            .unwrap();
        let channel = FakeDataChannel::stalled(&channel_label(id), 1);
        link.channel_opened(channel.clone(), ChannelOrigin::Local, &tx);

        tokio::time::timeout(Duration::from_secs(1), async {
            while channel.sent().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        link.close().await;
        channel.release(10);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(channel.sent().len(), 2);
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, InternalEvent::SendProgress { .. }));
        }
    }

    #[tokio::test]
    async fn test_close_discards_everything() {
        let (mut link, connection) = link("b").await;
        link.add_remote_candidate(IceCandidate::new("c1")).await;

        link.close().await;

        assert_eq!(link.state(), NegotiationState::Closed);
        assert_eq!(link.negotiation().pending_candidates(), 0);
        assert!(connection.calls().contains(&Call::Close));
    }
}
