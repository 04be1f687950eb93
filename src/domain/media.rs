/// Local media flags and the participant roster shown to the user
use crate::domain::shared::value_objects::MemberId;
use serde::{Deserialize, Serialize};

/// Where the outgoing video track comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoSource {
    Camera,
    Screen,
}

/// Enabled flags of the local tracks
///
/// Muting flips the flag on the track; the track stays attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub video_source: VideoSource,
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
            video_source: VideoSource::Camera,
        }
    }
}

pub const LOCAL_PARTICIPANT_ID: &str = "local";

/// Presentation projection of one call participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// `"local"` or the remote member id
    pub id: String,
    /// Media stream shown for this participant, once known
    pub stream_id: Option<String>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub display_name: String,
}

impl Participant {
    pub fn local(stream_id: impl Into<String>) -> Self {
        Self {
            id: LOCAL_PARTICIPANT_ID.to_string(),
            stream_id: Some(stream_id.into()),
            audio_enabled: true,
            video_enabled: true,
            display_name: "You".to_string(),
        }
    }

    pub fn remote(member: &MemberId) -> Self {
        Self {
            id: member.to_string(),
            stream_id: None,
            audio_enabled: true,
            video_enabled: true,
            display_name: format!("User {}", member.short()),
        }
    }

    pub fn is_local(&self) -> bool {
        self.id == LOCAL_PARTICIPANT_ID
    }
}

/// Ordered participant list: the local entry first, then one entry per
/// remote peer in the order links were created.
#[derive(Debug, Default, Clone)]
pub struct Roster {
    local: Option<Participant>,
    remotes: Vec<Participant>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local(&mut self, participant: Participant) {
        self.local = Some(participant);
    }

    /// Mirror the local media flags into the local entry
    pub fn sync_local(&mut self, media: &LocalMediaState) {
        if let Some(local) = self.local.as_mut() {
            local.audio_enabled = media.audio_enabled;
            local.video_enabled = media.video_enabled;
        }
    }

    /// Add a remote entry unless one exists
    pub fn add_remote(&mut self, member: &MemberId) -> bool {
        if self.remotes.iter().any(|p| p.id == member.as_str()) {
            return false;
        }
        self.remotes.push(Participant::remote(member));
        true
    }

    /// Attach the remote media stream to an existing entry
    pub fn set_stream(&mut self, member: &MemberId, stream_id: &str) -> bool {
        match self.remotes.iter_mut().find(|p| p.id == member.as_str()) {
            Some(p) if p.stream_id.as_deref() != Some(stream_id) => {
                p.stream_id = Some(stream_id.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, member: &MemberId) -> bool {
        let before = self.remotes.len();
        self.remotes.retain(|p| p.id != member.as_str());
        before != self.remotes.len()
    }

    pub fn clear(&mut self) {
        self.local = None;
        self.remotes.clear();
    }

    pub fn len(&self) -> usize {
        self.remotes.len() + usize::from(self.local.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Participant> {
        self.local
            .iter()
            .chain(self.remotes.iter())
            .cloned()
            .collect()
    }
}
