/// Per-peer offer/answer negotiation state machine
///
/// Pure bookkeeping: which side we play, how far the exchange got, and the
/// remote ICE candidates that arrived before a remote description could
/// take them. The transport calls themselves live in `PeerLink`.
use crate::domain::shared::error::DomainError;
use crate::domain::shared::result::Result;
use crate::domain::shared::value_objects::MemberId;
use crate::domain::signaling::IceCandidate;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Negotiating,
    Connected,
    Closed,
}

/// Which half of the exchange this side plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Saw `user-joined` and sent the offer
    Offerer,
    /// Received an offer from an unknown peer
    Answerer,
}

#[derive(Debug)]
pub struct Negotiation {
    peer_id: MemberId,
    role: Option<Role>,
    state: NegotiationState,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    started_at: Option<Instant>,
}

impl Negotiation {
    pub fn new(peer_id: MemberId) -> Self {
        Self {
            peer_id,
            role: None,
            state: NegotiationState::Idle,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            started_at: None,
        }
    }

    pub fn peer_id(&self) -> &MemberId {
        &self.peer_id
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Idle → Negotiating as offerer
    pub fn begin_offer(&mut self) -> Result<()> {
        self.begin(Role::Offerer)
    }

    /// Idle → Negotiating as answerer
    pub fn begin_answer(&mut self) -> Result<()> {
        self.begin(Role::Answerer)
    }

    fn begin(&mut self, role: Role) -> Result<()> {
        if self.state != NegotiationState::Idle {
            return Err(DomainError::InvalidStateTransition(format!(
                "cannot start negotiation with {} from {:?}",
                self.peer_id, self.state
            )));
        }
        self.role = Some(role);
        self.state = NegotiationState::Negotiating;
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// Check that an incoming answer may be applied
    pub fn expect_answer(&self) -> Result<()> {
        if self.role != Some(Role::Offerer) || self.state != NegotiationState::Negotiating {
            return Err(DomainError::InvalidStateTransition(format!(
                "unexpected answer from {} in {:?}",
                self.peer_id, self.state
            )));
        }
        Ok(())
    }

    /// Record that the remote description was applied and hand back the
    /// buffered candidates in arrival order.
    pub fn remote_description_applied(&mut self) -> Result<Vec<IceCandidate>> {
        if self.state != NegotiationState::Negotiating {
            return Err(DomainError::InvalidStateTransition(format!(
                "remote description for {} applied in {:?}",
                self.peer_id, self.state
            )));
        }
        self.remote_description_set = true;
        Ok(self.pending_candidates.drain(..).collect())
    }

    /// Negotiating → Connected
    ///
    /// For the offerer this follows the answer; the answerer takes it as
    /// soon as its answer is sent, without waiting for confirmation.
    pub fn complete(&mut self) -> Result<()> {
        if self.state != NegotiationState::Negotiating || !self.remote_description_set {
            return Err(DomainError::InvalidStateTransition(format!(
                "cannot complete negotiation with {} in {:?}",
                self.peer_id, self.state
            )));
        }
        self.state = NegotiationState::Connected;
        Ok(())
    }

    /// Returns the candidate if it can be applied now, otherwise queues it.
    /// Candidates for a closed link are discarded.
    pub fn accept_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        match self.state {
            NegotiationState::Closed => None,
            _ if self.remote_description_set => Some(candidate),
            _ => {
                self.pending_candidates.push_back(candidate);
                None
            }
        }
    }

    pub fn close(&mut self) {
        self.state = NegotiationState::Closed;
        self.pending_candidates.clear();
    }

    /// True when still negotiating after `timeout`
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        match (self.state, self.started_at) {
            (NegotiationState::Negotiating, Some(started)) => {
                now.saturating_duration_since(started) >= timeout
            }
            _ => false,
        }
    }
}
