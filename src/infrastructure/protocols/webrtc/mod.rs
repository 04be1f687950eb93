//! WebRTC peer links and the connection manager
pub mod manager;
pub mod peer_link;
pub mod rtc;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::{
    Command, InternalEvent, ManagerError, ManagerInbox, PeerConnectionManager, SessionUpdate,
};
pub use peer_link::{LinkError, LinkOutput, OutgoingFile, PeerLink, WHITEBOARD_LABEL};
pub use rtc::WebRtcPeerFactory;
pub use transport::{
    ChannelMessage, ChannelOrigin, ConnectionState, DataChannel, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEventSender, TransportError, TransportEvent,
};
