/// Signaling relay for room members
///
/// Each WebSocket connection gets a server-assigned member id and an
/// outbound queue drained by its own writer task. Offers, answers and ICE
/// candidates go to the named target only; membership changes go to the
/// rest of the room.
use super::metrics_handler::{record_relay_dropped, record_relay_forwarded, update_relay_gauges};
use crate::domain::room::{LeaveOutcome, RoomRegistry};
use crate::domain::shared::value_objects::{MemberId, RoomId};
use crate::domain::signaling::{ClientEvent, RelayKind, ServerEvent};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// One connected client
#[derive(Debug)]
struct Connection {
    tx: mpsc::UnboundedSender<ServerEvent>,
    connected_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Default)]
struct Relay {
    rooms: RoomRegistry,
    connections: HashMap<MemberId, Connection>,
}

impl Relay {
    fn send(&self, to: &MemberId, event: ServerEvent) -> bool {
        match self.connections.get(to) {
            Some(conn) => conn.tx.send(event).is_ok(),
            None => false,
        }
    }

    fn notify_left(&self, room_id: &RoomId, member: &MemberId, outcome: LeaveOutcome) {
        match outcome {
            LeaveOutcome::Left { remaining } => {
                info!("{} left room {}", member, room_id);
                for other in &remaining {
                    self.send(
                        other,
                        ServerEvent::UserLeft {
                            room_id: room_id.clone(),
                            user_id: member.clone(),
                        },
                    );
                }
            }
            LeaveOutcome::RoomClosed => {
                info!("{} left room {}; room closed", member, room_id);
            }
            LeaveOutcome::NotMember => {
                debug!("{} is not in room {}", member, room_id);
            }
        }
    }

    fn publish_gauges(&self) {
        update_relay_gauges(self.rooms.room_count(), self.connections.len());
    }
}

/// Shared relay state
#[derive(Debug, Default)]
pub struct SignalingState {
    inner: RwLock<Relay>,
}

impl SignalingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and queue its `welcome`
    pub async fn connect(&self) -> (MemberId, mpsc::UnboundedReceiver<ServerEvent>) {
        let member_id = MemberId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ServerEvent::Welcome {
            member_id: member_id.clone(),
        });

        let mut relay = self.inner.write().await;
        relay.connections.insert(
            member_id.clone(),
            Connection {
                tx,
                connected_at: chrono::Utc::now(),
            },
        );
        relay.publish_gauges();
        (member_id, rx)
    }

    /// Drop a connection and leave every room it was in
    pub async fn disconnect(&self, member: &MemberId) {
        let mut relay = self.inner.write().await;
        if let Some(conn) = relay.connections.remove(member) {
            let duration = chrono::Utc::now() - conn.connected_at;
            info!(
                "{} disconnected after {}s",
                member,
                duration.num_seconds()
            );
        }
        for (room_id, outcome) in relay.rooms.remove_member(member) {
            relay.notify_left(&room_id, member, outcome);
        }
        relay.publish_gauges();
    }

    /// Apply one client frame. The whole frame is handled under one write
    /// lock, so relay operations never interleave.
    pub async fn handle_event(&self, from: &MemberId, event: ClientEvent) {
        let mut relay = self.inner.write().await;
        match event {
            ClientEvent::JoinRoom { room_id } => {
                let outcome = relay.rooms.join(&room_id, from);
                if outcome.newly_joined {
                    info!("{} joined room {}", from, room_id);
                    for other in &outcome.existing {
                        relay.send(
                            other,
                            ServerEvent::UserJoined {
                                room_id: room_id.clone(),
                                user_id: from.clone(),
                            },
                        );
                    }
                } else {
                    debug!("{} re-joined room {}", from, room_id);
                }
                relay.send(
                    from,
                    ServerEvent::RoomUsers {
                        room_id,
                        users: outcome.existing,
                    },
                );
            }
            ClientEvent::LeaveRoom { room_id } => {
                let outcome = relay.rooms.leave(&room_id, from);
                relay.notify_left(&room_id, from, outcome);
            }
            event => {
                if let Some(relayed) = event.into_relayed(from) {
                    let kind = relayed.kind;
                    let target = relayed.target.clone();
                    if relay.send(&relayed.target, relayed.event) {
                        debug!("Forwarded {} from {} to {}", kind, from, target);
                        record_relay_forwarded(kind);
                    } else {
                        warn!(
                            "Dropped {} from {}: target {} not connected",
                            kind, from, target
                        );
                        record_relay_dropped(kind);
                    }
                }
            }
        }
        relay.publish_gauges();
    }

    /// Queue an event for one connection
    pub async fn send_to(&self, member: &MemberId, event: ServerEvent) -> bool {
        self.inner.read().await.send(member, event)
    }

    pub async fn room_members(&self, room_id: &RoomId) -> Vec<MemberId> {
        self.inner
            .read()
            .await
            .rooms
            .get(room_id)
            .map(|room| room.members().to_vec())
            .unwrap_or_default()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.room_count()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

/// `GET /ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SignalingState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<SignalingState>) {
    let (member_id, mut rx) = state.connect().await;
    info!("Signaling connection established for {}", member_id);

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let recv_member = member_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => recv_state.handle_event(&recv_member, event).await,
                    Err(e) => {
                        warn!("Unparseable frame from {}: {}", recv_member, e);
                        recv_state
                            .send_to(
                                &recv_member,
                                ServerEvent::Error {
                                    code: "PARSE_ERROR".to_string(),
                                    message: format!("Invalid message format: {}", e),
                                },
                            )
                            .await;
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket error for {}: {}", recv_member, e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.disconnect(&member_id).await;
}
