/// Peer Connection Manager
///
/// Owns the local media, one `PeerLink` per remote member and the local
/// whiteboard. Every mutation runs on the task that drives `run`, fed by
/// three queues: user commands, relay events and transport events.
use super::peer_link::{LinkError, LinkOutput, OutgoingFile, PeerLink};
use super::transport::{PeerConnectionFactory, PeerEvent, PeerEventSender, TransportEvent};
use crate::domain::file_transfer::{Direction, ReceivedFile, TransferError};
use crate::domain::media::{LocalMediaState, Participant, Roster, VideoSource};
use crate::domain::negotiation::NegotiationState;
use crate::domain::shared::value_objects::{MemberId, RoomId, TransferId};
use crate::domain::signaling::{ClientEvent, IceCandidate, SessionDescription, ServerEvent};
use crate::domain::whiteboard::{Color, DrawEvent, Tool, Whiteboard, DEFAULT_HEIGHT, DEFAULT_WIDTH};
use crate::infrastructure::media::{LocalStream, LocalTrack, MediaDevices, MediaError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Candidates kept per peer that has not offered yet
const MAX_EARLY_CANDIDATES: usize = 64;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("call not started")]
    NotStarted,

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("signaling connection closed")]
    SignalingClosed,
}

/// Notifications produced off the manager task
#[derive(Debug)]
pub enum InternalEvent {
    /// The screen capture track ended outside of the manager
    ScreenTrackEnded { track_id: String },
    SendProgress {
        peer_id: MemberId,
        transfer_id: TransferId,
        percent: u8,
    },
    SendFinished {
        peer_id: MemberId,
        transfer_id: TransferId,
        name: String,
        result: Result<u64, TransferError>,
    },
}

/// Observable session state for the embedding application
#[derive(Debug)]
pub enum SessionUpdate {
    Participants(Vec<Participant>),
    LocalMedia(LocalMediaState),
    TransferStarted {
        peer_id: MemberId,
        transfer_id: TransferId,
        name: String,
        size: u64,
    },
    TransferProgress {
        peer_id: MemberId,
        transfer_id: TransferId,
        direction: Direction,
        percent: u8,
    },
    FileReceived {
        peer_id: MemberId,
        file: ReceivedFile,
    },
    FileSent {
        peer_id: MemberId,
        transfer_id: TransferId,
        name: String,
        size: u64,
    },
    TransferFailed {
        peer_id: MemberId,
        transfer_id: TransferId,
        error: String,
    },
    /// Segment drawn by the local pointer
    LocalStroke(DrawEvent),
    RemoteStroke(DrawEvent),
    WhiteboardCleared,
    CommandFailed {
        command: &'static str,
        error: String,
    },
    Left,
}

#[derive(Debug)]
pub enum Command {
    Start,
    ToggleAudio,
    ToggleVideo,
    ToggleScreenShare,
    SendFile(OutgoingFile),
    PointerDown { x: f64, y: f64 },
    PointerMove { x: f64, y: f64 },
    PointerUp,
    SetTool(Tool),
    SetColor(Color),
    /// Clamped to 1..=20
    SetLineWidth(f64),
    ClearWhiteboard,
    Leave,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::ToggleAudio => "toggle-audio",
            Command::ToggleVideo => "toggle-video",
            Command::ToggleScreenShare => "toggle-screen-share",
            Command::SendFile(_) => "send-file",
            Command::PointerDown { .. } => "pointer-down",
            Command::PointerMove { .. } => "pointer-move",
            Command::PointerUp => "pointer-up",
            Command::SetTool(_) => "set-tool",
            Command::SetColor(_) => "set-color",
            Command::SetLineWidth(_) => "set-line-width",
            Command::ClearWhiteboard => "clear-whiteboard",
            Command::Leave => "leave",
        }
    }
}

/// Receiving halves of the manager's own event queues
pub struct ManagerInbox {
    pub peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    pub internal: mpsc::UnboundedReceiver<InternalEvent>,
}

/// Candidates relayed by a peer before its offer arrived
struct EarlyCandidates {
    since: Instant,
    candidates: Vec<IceCandidate>,
}

struct LocalSession {
    stream: LocalStream,
    /// Track currently sent as video: the camera or a screen capture
    video: Arc<LocalTrack>,
    screen_watch: Option<AbortHandle>,
}

impl LocalSession {
    fn tracks(&self) -> [Arc<LocalTrack>; 2] {
        [self.stream.audio.clone(), self.video.clone()]
    }

    fn stop(&mut self) {
        if let Some(watch) = self.screen_watch.take() {
            watch.abort();
        }
        self.stream.stop();
        self.video.stop();
    }
}

pub struct PeerConnectionManager {
    room_id: RoomId,
    factory: Arc<dyn PeerConnectionFactory>,
    devices: Arc<dyn MediaDevices>,
    signaling: mpsc::UnboundedSender<ClientEvent>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    peer_events: PeerEventSender,
    internal: mpsc::UnboundedSender<InternalEvent>,
    negotiation_timeout: Duration,
    member_id: Option<MemberId>,
    local: Option<LocalSession>,
    media: LocalMediaState,
    links: HashMap<MemberId, PeerLink>,
    early_candidates: HashMap<MemberId, EarlyCandidates>,
    roster: Roster,
    whiteboard: Whiteboard,
}

impl PeerConnectionManager {
    pub fn new(
        room_id: RoomId,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        signaling: mpsc::UnboundedSender<ClientEvent>,
        updates: mpsc::UnboundedSender<SessionUpdate>,
        negotiation_timeout: Duration,
    ) -> (Self, ManagerInbox) {
        let (peer_events, peer_events_rx) = mpsc::unbounded_channel();
        let (internal, internal_rx) = mpsc::unbounded_channel();

        let manager = Self {
            room_id,
            factory,
            devices,
            signaling,
            updates,
            peer_events,
            internal,
            negotiation_timeout,
            member_id: None,
            local: None,
            media: LocalMediaState::default(),
            links: HashMap::new(),
            early_candidates: HashMap::new(),
            roster: Roster::new(),
            whiteboard: Whiteboard::new(DEFAULT_WIDTH, DEFAULT_HEIGHT),
        };
        let inbox = ManagerInbox {
            peer_events: peer_events_rx,
            internal: internal_rx,
        };
        (manager, inbox)
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn member_id(&self) -> Option<&MemberId> {
        self.member_id.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.local.is_some()
    }

    pub fn media_state(&self) -> LocalMediaState {
        self.media
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.roster.snapshot()
    }

    pub fn peer_count(&self) -> usize {
        self.links.len()
    }

    pub fn link_state(&self, peer: &MemberId) -> Option<NegotiationState> {
        self.links.get(peer).map(|link| link.state())
    }

    pub fn whiteboard(&self) -> &Whiteboard {
        &self.whiteboard
    }

    /// Current outgoing video track, if started
    pub fn video_track(&self) -> Option<Arc<LocalTrack>> {
        self.local.as_ref().map(|session| session.video.clone())
    }

    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    fn emit_participants(&self) {
        self.emit(SessionUpdate::Participants(self.roster.snapshot()));
    }

    fn signal(&self, event: ClientEvent) -> Result<(), ManagerError> {
        self.signaling
            .send(event)
            .map_err(|_| ManagerError::SignalingClosed)
    }

    /// Acquire camera and microphone, then join the room. A media failure
    /// leaves the manager untouched so `start` can be retried.
    pub async fn start(&mut self) -> Result<Participant, ManagerError> {
        if let Some(session) = &self.local {
            debug!("Already started with stream {}", session.stream.id);
            return Ok(Participant::local(session.stream.id.clone()));
        }

        let stream = self.devices.user_media().await.map_err(|e| {
            error!("Failed to acquire camera and microphone: {}", e);
            e
        })?;

        let participant = Participant::local(stream.id.clone());
        self.media = LocalMediaState::default();
        self.roster.set_local(participant.clone());
        self.local = Some(LocalSession {
            video: stream.video.clone(),
            stream,
            screen_watch: None,
        });

        self.signal(ClientEvent::JoinRoom {
            room_id: self.room_id.clone(),
        })?;
        info!("Joining room {}", self.room_id);

        self.emit(SessionUpdate::LocalMedia(self.media));
        self.emit_participants();
        Ok(participant)
    }

    pub fn toggle_audio(&mut self) -> Result<bool, ManagerError> {
        let session = self.local.as_ref().ok_or(ManagerError::NotStarted)?;
        let enabled = !session.stream.audio.is_enabled();
        session.stream.audio.set_enabled(enabled);
        self.media.audio_enabled = enabled;
        self.local_media_changed();
        Ok(enabled)
    }

    pub fn toggle_video(&mut self) -> Result<bool, ManagerError> {
        let session = self.local.as_ref().ok_or(ManagerError::NotStarted)?;
        let enabled = !session.video.is_enabled();
        session.video.set_enabled(enabled);
        self.media.video_enabled = enabled;
        self.local_media_changed();
        Ok(enabled)
    }

    fn local_media_changed(&mut self) {
        self.roster.sync_local(&self.media);
        self.emit(SessionUpdate::LocalMedia(self.media));
        self.emit_participants();
    }

    /// Switch the outgoing video between camera and screen capture on every
    /// link by replacing the sender's track. No new offer is made.
    pub async fn toggle_screen_share(&mut self) -> Result<VideoSource, ManagerError> {
        let stream_id = self
            .local
            .as_ref()
            .ok_or(ManagerError::NotStarted)?
            .stream
            .id
            .clone();

        let (next, source) = match self.media.video_source {
            VideoSource::Camera => (
                self.devices.display_media(stream_id).await?,
                VideoSource::Screen,
            ),
            VideoSource::Screen => (
                self.devices.camera_video(stream_id).await?,
                VideoSource::Camera,
            ),
        };
        next.set_enabled(self.media.video_enabled);

        for link in self.links.values() {
            if let Err(e) = link.replace_video_track(next.clone()).await {
                warn!("Failed to replace video track for {}: {}", link.peer_id(), e);
            }
        }

        let session = self.local.as_mut().ok_or(ManagerError::NotStarted)?;
        if let Some(watch) = session.screen_watch.take() {
            watch.abort();
        }
        let previous = std::mem::replace(&mut session.video, next.clone());
        previous.stop();

        if source == VideoSource::Screen {
            let internal = self.internal.clone();
            let track = next.clone();
            let task = tokio::spawn(async move {
                track.ended().await;
                let _ = internal.send(InternalEvent::ScreenTrackEnded {
                    track_id: track.id().to_string(),
                });
            });
            session.screen_watch = Some(task.abort_handle());
        }

        self.media.video_source = source;
        info!("Video source is now {:?}", source);
        self.local_media_changed();
        Ok(source)
    }

    /// Stop local media, close every link and leave the room
    pub async fn leave(&mut self) -> Result<(), ManagerError> {
        let Some(mut session) = self.local.take() else {
            return Ok(());
        };
        session.stop();

        for (_, mut link) in self.links.drain() {
            link.close().await;
        }
        self.early_candidates.clear();
        self.roster.clear();
        self.media = LocalMediaState::default();

        info!("Leaving room {}", self.room_id);
        let sent = self.signal(ClientEvent::LeaveRoom {
            room_id: self.room_id.clone(),
        });
        self.emit(SessionUpdate::Left);
        sent
    }

    /// Offer `file` to every connected peer, one transfer each
    pub async fn send_file(
        &mut self,
        file: OutgoingFile,
    ) -> Result<Vec<(MemberId, TransferId)>, ManagerError> {
        if self.local.is_none() {
            return Err(ManagerError::NotStarted);
        }

        let mut transfers = Vec::new();
        for link in self.links.values_mut() {
            if link.state() != NegotiationState::Connected {
                continue;
            }
            match link.send_file(file.clone()).await {
                Ok(id) => transfers.push((link.peer_id().clone(), id)),
                Err(e) => warn!("Cannot send {} to {}: {}", file.name(), link.peer_id(), e),
            }
        }
        if transfers.is_empty() {
            info!("No connected peers to send {} to", file.name());
        }
        Ok(transfers)
    }

    pub fn pointer_down(&mut self, x: f64, y: f64) {
        self.whiteboard.pointer_down(x, y);
    }

    /// Draw locally and send the segment to every peer with an open
    /// whiteboard channel
    pub async fn pointer_move(&mut self, x: f64, y: f64) -> Option<DrawEvent> {
        let event = self.whiteboard.pointer_move(x, y)?;
        self.emit(SessionUpdate::LocalStroke(event));
        for link in self.links.values() {
            link.send_stroke(&event).await;
        }
        Some(event)
    }

    pub fn pointer_up(&mut self) {
        self.whiteboard.pointer_up();
    }

    pub fn set_tool(&mut self, tool: Tool) {
        debug!("Whiteboard tool is now {:?}", tool);
        self.whiteboard.set_tool(tool);
    }

    pub fn set_color(&mut self, color: Color) {
        self.whiteboard.set_color(color);
    }

    pub fn set_line_width(&mut self, width: f64) {
        self.whiteboard.set_line_width(width);
    }

    /// Clears the local canvas only
    pub fn clear_whiteboard(&mut self) {
        self.whiteboard.clear();
        self.emit(SessionUpdate::WhiteboardCleared);
    }

    pub async fn handle_command(&mut self, command: Command) -> Result<(), ManagerError> {
        match command {
            Command::Start => self.start().await.map(|_| ()),
            Command::ToggleAudio => self.toggle_audio().map(|_| ()),
            Command::ToggleVideo => self.toggle_video().map(|_| ()),
            Command::ToggleScreenShare => self.toggle_screen_share().await.map(|_| ()),
            Command::SendFile(file) => self.send_file(file).await.map(|_| ()),
            Command::PointerDown { x, y } => {
                self.pointer_down(x, y);
                Ok(())
            }
            Command::PointerMove { x, y } => {
                self.pointer_move(x, y).await;
                Ok(())
            }
            Command::PointerUp => {
                self.pointer_up();
                Ok(())
            }
            Command::SetTool(tool) => {
                self.set_tool(tool);
                Ok(())
            }
            Command::SetColor(color) => {
                self.set_color(color);
                Ok(())
            }
            Command::SetLineWidth(width) => {
                self.set_line_width(width);
                Ok(())
            }
            Command::ClearWhiteboard => {
                self.clear_whiteboard();
                Ok(())
            }
            Command::Leave => self.leave().await,
        }
    }

    pub async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Welcome { member_id } => {
                info!("Relay assigned member id {}", member_id);
                self.member_id = Some(member_id);
            }
            ServerEvent::RoomUsers { room_id, users } => {
                info!(
                    "Room {} has {} other member(s); waiting for their offers",
                    room_id,
                    users.len()
                );
            }
            ServerEvent::UserJoined { room_id, user_id } => {
                if room_id != self.room_id || self.is_self(&user_id) {
                    return;
                }
                if let Err(e) = self.offer_to(user_id.clone()).await {
                    warn!("Failed to start negotiation with {}: {}", user_id, e);
                    self.remove_peer(&user_id).await;
                }
            }
            ServerEvent::UserLeft { room_id, user_id } => {
                if room_id == self.room_id {
                    self.remove_peer(&user_id).await;
                }
            }
            ServerEvent::Offer { sdp, from, .. } => {
                if let Err(e) = self.answer_to(from.clone(), sdp).await {
                    warn!("Failed to answer offer from {}: {}", from, e);
                    self.remove_peer(&from).await;
                }
            }
            ServerEvent::Answer { sdp, from, .. } => match self.links.get_mut(&from) {
                Some(link) => {
                    if let Err(e) = link.apply_answer(sdp).await {
                        warn!("Failed to apply answer from {}: {}", from, e);
                    }
                }
                None => debug!("Answer from unknown peer {}", from),
            },
            ServerEvent::IceCandidate {
                candidate, from, ..
            } => match self.links.get_mut(&from) {
                Some(link) => link.add_remote_candidate(candidate).await,
                None => self.buffer_early_candidate(from, candidate),
            },
            ServerEvent::Error { code, message } => {
                warn!("Relay reported {}: {}", code, message);
            }
        }
    }

    fn buffer_early_candidate(&mut self, from: MemberId, candidate: IceCandidate) {
        let early = self
            .early_candidates
            .entry(from.clone())
            .or_insert_with(|| EarlyCandidates {
                since: Instant::now(),
                candidates: Vec::new(),
            });
        if early.candidates.len() >= MAX_EARLY_CANDIDATES {
            warn!("Dropping candidate from {}: too many before its offer", from);
            return;
        }
        debug!("Buffering candidate from not yet known peer {}", from);
        early.candidates.push(candidate);
    }

    fn is_self(&self, member: &MemberId) -> bool {
        self.member_id.as_ref() == Some(member)
    }

    async fn create_link(&mut self, peer_id: &MemberId) -> Result<PeerLink, ManagerError> {
        let session = self.local.as_ref().ok_or(ManagerError::NotStarted)?;
        let connection = self
            .factory
            .create(peer_id, self.peer_events.clone())
            .await
            .map_err(LinkError::from)?;
        let mut link = PeerLink::connect(peer_id.clone(), connection, &session.tracks()).await?;

        if let Some(early) = self.early_candidates.remove(peer_id) {
            for candidate in early.candidates {
                link.add_remote_candidate(candidate).await;
            }
        }
        Ok(link)
    }

    fn insert_link(&mut self, link: PeerLink) {
        let peer_id = link.peer_id().clone();
        self.links.insert(peer_id.clone(), link);
        if self.roster.add_remote(&peer_id) {
            self.emit_participants();
        }
    }

    /// Offerer path, taken by members already in the room
    async fn offer_to(&mut self, peer_id: MemberId) -> Result<(), ManagerError> {
        if self.links.contains_key(&peer_id) {
            debug!("Already linked to {}", peer_id);
            return Ok(());
        }
        let mut link = self.create_link(&peer_id).await?;
        let offer = link.start_offer().await;
        self.insert_link(link);

        self.signal(ClientEvent::Offer {
            sdp: offer?,
            room_id: self.room_id.clone(),
            target: peer_id.clone(),
        })?;
        info!("Sent offer to {}", peer_id);
        Ok(())
    }

    /// Answerer path, taken on an offer from a peer without a link
    async fn answer_to(
        &mut self,
        peer_id: MemberId,
        offer: SessionDescription,
    ) -> Result<(), ManagerError> {
        if let Some(link) = self.links.get(&peer_id) {
            warn!(
                "Ignoring offer from {}: link already in {:?}",
                peer_id,
                link.state()
            );
            return Ok(());
        }
        let mut link = self.create_link(&peer_id).await?;
        let answer = link.accept_offer(offer).await;
        self.insert_link(link);

        self.signal(ClientEvent::Answer {
            sdp: answer?,
            room_id: self.room_id.clone(),
            target: peer_id.clone(),
        })?;
        info!("Sent answer to {}", peer_id);
        Ok(())
    }

    /// Close and forget the link to `peer_id`
    pub async fn remove_peer(&mut self, peer_id: &MemberId) -> bool {
        self.early_candidates.remove(peer_id);
        let Some(mut link) = self.links.remove(peer_id) else {
            return false;
        };
        link.close().await;
        if self.roster.remove(peer_id) {
            self.emit_participants();
        }
        true
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        let PeerEvent { peer_id, event } = event;
        let Some(link) = self.links.get_mut(&peer_id) else {
            debug!("Dropping {:?} for unknown peer {}", event, peer_id);
            return;
        };

        match event {
            TransportEvent::IceCandidate(candidate) => {
                let sent = self.signal(ClientEvent::IceCandidate {
                    candidate,
                    room_id: self.room_id.clone(),
                    target: peer_id.clone(),
                });
                if sent.is_err() {
                    warn!("Cannot send ICE candidate to {}: signaling closed", peer_id);
                }
            }
            TransportEvent::ConnectionState(state) => {
                debug!("Connection to {} is {:?}", peer_id, state);
                if state.is_terminal() {
                    warn!("Connection to {} {:?}; evicting", peer_id, state);
                    self.remove_peer(&peer_id).await;
                }
            }
            TransportEvent::RemoteTrack {
                track_id,
                stream_id,
                kind,
            } => {
                debug!("Remote {:?} track {} from {}", kind, track_id, peer_id);
                link.set_remote_stream(stream_id.clone());
                if self.roster.set_stream(&peer_id, &stream_id) {
                    self.emit_participants();
                }
            }
            TransportEvent::ChannelOpen { channel, origin } => {
                link.channel_opened(channel, origin, &self.internal);
            }
            TransportEvent::ChannelMessage { label, message } => {
                if let Some(output) = link.handle_channel_message(&label, message).await {
                    self.apply_output(peer_id, output);
                }
            }
            TransportEvent::ChannelClosed { label } => {
                debug!("Channel {} to {} closed", label, peer_id);
                if let Some(output) = link.channel_closed(&label) {
                    self.apply_output(peer_id, output);
                }
            }
        }
    }

    fn apply_output(&mut self, peer_id: MemberId, output: LinkOutput) {
        let update = match output {
            LinkOutput::Stroke(event) => {
                self.whiteboard.apply_remote(&event);
                SessionUpdate::RemoteStroke(event)
            }
            LinkOutput::Started {
                transfer_id,
                name,
                size,
            } => SessionUpdate::TransferStarted {
                peer_id,
                transfer_id,
                name,
                size,
            },
            LinkOutput::Progress {
                transfer_id,
                direction,
                percent,
            } => SessionUpdate::TransferProgress {
                peer_id,
                transfer_id,
                direction,
                percent,
            },
            LinkOutput::Received(file) => SessionUpdate::FileReceived { peer_id, file },
            LinkOutput::Failed { transfer_id, error } => SessionUpdate::TransferFailed {
                peer_id,
                transfer_id,
                error: error.to_string(),
            },
        };
        self.emit(update);
    }

    pub async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::ScreenTrackEnded { track_id } => {
                let sharing = self.media.video_source == VideoSource::Screen
                    && self
                        .local
                        .as_ref()
                        .is_some_and(|session| session.video.id() == track_id);
                if !sharing {
                    return;
                }
                info!("Screen capture ended; reverting to camera");
                if let Err(e) = self.toggle_screen_share().await {
                    error!("Failed to revert to camera: {}", e);
                    self.emit(SessionUpdate::CommandFailed {
                        command: "toggle-screen-share",
                        error: e.to_string(),
                    });
                }
            }
            InternalEvent::SendProgress {
                peer_id,
                transfer_id,
                percent,
            } => self.emit(SessionUpdate::TransferProgress {
                peer_id,
                transfer_id,
                direction: Direction::Outgoing,
                percent,
            }),
            InternalEvent::SendFinished {
                peer_id,
                transfer_id,
                name,
                result,
            } => match result {
                Ok(size) => {
                    info!("Sent {} ({} bytes) to {}", name, size, peer_id);
                    self.emit(SessionUpdate::FileSent {
                        peer_id,
                        transfer_id,
                        name,
                        size,
                    });
                }
                Err(e) => {
                    warn!("Sending {} to {} failed: {}", name, peer_id, e);
                    self.emit(SessionUpdate::TransferFailed {
                        peer_id,
                        transfer_id,
                        error: e.to_string(),
                    });
                }
            },
        }
    }

    /// Evict links stuck negotiating past the timeout, and forget buffered
    /// candidates from peers whose offer never came
    pub async fn evict_expired(&mut self, now: Instant) -> Vec<MemberId> {
        let timeout = self.negotiation_timeout;
        self.early_candidates.retain(|peer_id, early| {
            let keep = now.saturating_duration_since(early.since) < timeout;
            if !keep {
                debug!(
                    "Discarding {} early candidates from {}",
                    early.candidates.len(),
                    peer_id
                );
            }
            keep
        });

        let expired: Vec<MemberId> = self
            .links
            .values()
            .filter(|link| link.is_expired(now, self.negotiation_timeout))
            .map(|link| link.peer_id().clone())
            .collect();

        for peer_id in &expired {
            warn!("Negotiation with {} timed out; evicting", peer_id);
            self.remove_peer(peer_id).await;
        }
        expired
    }

    /// Drive the session until `leave`, the command queue closing, or the
    /// relay connection dropping
    pub async fn run(
        mut self,
        mut inbox: ManagerInbox,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut relay: mpsc::UnboundedReceiver<ServerEvent>,
        sweep_interval: Duration,
    ) {
        let mut sweep = tokio::time::interval(sweep_interval);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Leave) | None => break,
                    Some(command) => {
                        let name = command.name();
                        if let Err(e) = self.handle_command(command).await {
                            warn!("Command {} failed: {}", name, e);
                            self.emit(SessionUpdate::CommandFailed {
                                command: name,
                                error: e.to_string(),
                            });
                        }
                    }
                },
                event = relay.recv() => match event {
                    Some(event) => self.handle_server_event(event).await,
                    None => {
                        warn!("Relay connection closed");
                        break;
                    }
                },
                Some(event) = inbox.peer_events.recv() => self.handle_peer_event(event).await,
                Some(event) = inbox.internal.recv() => self.handle_internal(event).await,
                _ = sweep.tick() => {
                    self.evict_expired(Instant::now()).await;
                }
            }
        }

        if let Err(e) = self.leave().await {
            debug!("Leave after shutdown: {}", e);
        }
    }
}
