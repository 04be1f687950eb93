/// Signaling wire messages
///
/// One JSON text frame per message, tagged by `type`. Session descriptions
/// and ICE candidates keep the browser's JSON shapes so they can be handed
/// to any WebRTC stack unchanged.
use crate::domain::shared::value_objects::{MemberId, RoomId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description (`{"type": "offer", "sdp": "v=0..."}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in `RTCIceCandidateInit` form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Kinds of message the relay forwards point-to-point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    Offer,
    Answer,
    IceCandidate,
}

impl RelayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayKind::Offer => "offer",
            RelayKind::Answer => "answer",
            RelayKind::IceCandidate => "ice-candidate",
        }
    }
}

impl fmt::Display for RelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client → relay messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinRoom {
        room_id: RoomId,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    Offer {
        sdp: SessionDescription,
        room_id: RoomId,
        target: MemberId,
    },
    Answer {
        sdp: SessionDescription,
        room_id: RoomId,
        target: MemberId,
    },
    IceCandidate {
        candidate: IceCandidate,
        room_id: RoomId,
        target: MemberId,
    },
}

/// A point-to-point message ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relayed {
    pub kind: RelayKind,
    pub target: MemberId,
    pub event: ServerEvent,
}

impl ClientEvent {
    /// Turn an offer/answer/candidate into the frame its target receives,
    /// stamped with the sender id. Room membership events yield `None`.
    pub fn into_relayed(self, from: &MemberId) -> Option<Relayed> {
        let from = from.clone();
        match self {
            ClientEvent::Offer {
                sdp,
                room_id,
                target,
            } => Some(Relayed {
                kind: RelayKind::Offer,
                target,
                event: ServerEvent::Offer { sdp, room_id, from },
            }),
            ClientEvent::Answer {
                sdp,
                room_id,
                target,
            } => Some(Relayed {
                kind: RelayKind::Answer,
                target,
                event: ServerEvent::Answer { sdp, room_id, from },
            }),
            ClientEvent::IceCandidate {
                candidate,
                room_id,
                target,
            } => Some(Relayed {
                kind: RelayKind::IceCandidate,
                target,
                event: ServerEvent::IceCandidate {
                    candidate,
                    room_id,
                    from,
                },
            }),
            ClientEvent::JoinRoom { .. } | ClientEvent::LeaveRoom { .. } => None,
        }
    }
}

/// Relay → client messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Sent once per connection with the id the relay assigned to it
    Welcome {
        member_id: MemberId,
    },
    RoomUsers {
        room_id: RoomId,
        users: Vec<MemberId>,
    },
    UserJoined {
        room_id: RoomId,
        user_id: MemberId,
    },
    UserLeft {
        room_id: RoomId,
        user_id: MemberId,
    },
    Offer {
        sdp: SessionDescription,
        room_id: RoomId,
        from: MemberId,
    },
    Answer {
        sdp: SessionDescription,
        room_id: RoomId,
        from: MemberId,
    },
    IceCandidate {
        candidate: IceCandidate,
        room_id: RoomId,
        from: MemberId,
    },
    Error {
        code: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_event_wire_format() {
        let event: ClientEvent = serde_json::from_value(json!({
            "type": "offer",
            "sdp": {"type": "offer", "sdp": "v=0"},
            "roomId": "abc123",
            "target": "peer-b"
        }))
        .unwrap();

        assert_eq!(
            event,
            ClientEvent::Offer {
                sdp: SessionDescription::offer("v=0"),
                room_id: RoomId::parse("abc123").unwrap(),
                target: MemberId::from("peer-b"),
            }
        );
    }

    #[test]
    fn test_join_room_wire_format() {
        let event = ClientEvent::JoinRoom {
            room_id: RoomId::parse("abc123").unwrap(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "join-room", "roomId": "abc123"})
        );
    }

    #[test]
    fn test_blank_room_id_is_rejected() {
        let parsed = serde_json::from_value::<ClientEvent>(json!({
            "type": "join-room",
            "roomId": ""
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_ice_candidate_browser_shape() {
        let candidate: IceCandidate = serde_json::from_value(json!({
            "candidate": "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }))
        .unwrap();

        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
        assert!(candidate.username_fragment.is_none());

        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["sdpMLineIndex"], 0);
        assert!(value.get("usernameFragment").is_none());
    }

    #[test]
    fn test_into_relayed_stamps_sender() {
        let event = ClientEvent::IceCandidate {
            candidate: IceCandidate::new("candidate:x"),
            room_id: RoomId::parse("r").unwrap(),
            target: MemberId::from("b"),
        };

        let relayed = event.into_relayed(&MemberId::from("a")).unwrap();

        assert_eq!(relayed.kind, RelayKind::IceCandidate);
        assert_eq!(relayed.target, MemberId::from("b"));
        assert_eq!(
            serde_json::to_value(&relayed.event).unwrap(),
            json!({
                "type": "ice-candidate",
                "candidate": {"candidate": "candidate:x"},
                "roomId": "r",
                "from": "a"
            })
        );
    }

    #[test]
    fn test_membership_events_are_not_relayed() {
        let event = ClientEvent::LeaveRoom {
            room_id: RoomId::parse("r").unwrap(),
        };
        assert!(event.into_relayed(&MemberId::from("a")).is_none());
    }

    #[test]
    fn test_server_event_wire_format() {
        let event = ServerEvent::RoomUsers {
            room_id: RoomId::parse("abc123").unwrap(),
            users: vec![MemberId::from("a")],
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "room-users", "roomId": "abc123", "users": ["a"]})
        );
    }
}
