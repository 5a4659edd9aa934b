use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};
use crate::media::LocalTrack;
use crate::negotiation::PeerCommand;
use crate::signaling::{IceCandidate, ParticipantId, SdpKind, SessionDescription};
use crate::transport::{RemoteStream, RemoteTrack, TransportState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    New,
    OfferSent,
    OfferReceived,
    Answered,
    Connected,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::New => write!(f, "New"),
            NegotiationState::OfferSent => write!(f, "OfferSent"),
            NegotiationState::OfferReceived => write!(f, "OfferReceived"),
            NegotiationState::Answered => write!(f, "Answered"),
            NegotiationState::Connected => write!(f, "Connected"),
            NegotiationState::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Offerer,
    Answerer,
}

/// What to do with a remote offer for a peer that already has an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    /// Stable: apply it and answer on this connection.
    Accept,
    /// Our own offer is outstanding and we win the tie-break.
    Ignore,
    /// Our own offer is outstanding and we lose: drop this connection and
    /// answer the remote offer on a fresh one.
    Supersede,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub id: ParticipantId,
    pub role: Role,
    pub state: NegotiationState,
}

/// Negotiation state of one remote participant. Transport work is delegated
/// to the peer's worker task through `commands`.
pub(crate) struct PeerConnection {
    id: ParticipantId,
    generation: u64,
    role: Role,
    state: NegotiationState,
    commands: mpsc::UnboundedSender<PeerCommand>,
    attached_tracks: HashSet<String>,
    /// Remote description applied; candidates can go straight to the transport.
    remote_applied: bool,
    /// Our SDP went out; local candidates can be signaled.
    local_signaled: bool,
    answer_in_flight: bool,
    transport_connected: bool,
    /// Feeds the stream already handed to the renderer.
    remote_tracks: Option<watch::Sender<Vec<RemoteTrack>>>,
    chat_open: bool,
    pending_candidates: VecDeque<IceCandidate>,
    held_local_candidates: VecDeque<IceCandidate>,
    deadline: Option<JoinHandle<()>>,
}

impl PeerConnection {
    pub(crate) fn new(
        id: ParticipantId,
        generation: u64,
        role: Role,
        commands: mpsc::UnboundedSender<PeerCommand>,
    ) -> Self {
        Self {
            id,
            generation,
            role,
            state: NegotiationState::New,
            commands,
            attached_tracks: HashSet::new(),
            remote_applied: false,
            local_signaled: false,
            answer_in_flight: false,
            transport_connected: false,
            remote_tracks: None,
            chat_open: false,
            pending_candidates: VecDeque::new(),
            held_local_candidates: VecDeque::new(),
            deadline: None,
        }
    }

    pub(crate) fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn state(&self) -> NegotiationState {
        self.state
    }

    pub(crate) fn is_chat_open(&self) -> bool {
        self.chat_open
    }

    #[cfg(test)]
    pub(crate) fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub(crate) fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.id.clone(),
            role: self.role,
            state: self.state,
        }
    }

    fn send(&self, command: PeerCommand) {
        if self.commands.send(command).is_err() {
            debug!(peer = %self.id, "negotiation worker already gone");
        }
    }

    /// Queue a local track for this connection. A track is attached at most once.
    pub(crate) fn attach_track(&mut self, track: &Arc<LocalTrack>) -> bool {
        if self.state == NegotiationState::Closed || !self.attached_tracks.insert(track.id().to_owned()) {
            return false;
        }
        self.send(PeerCommand::AddTrack(Arc::clone(track)));
        true
    }

    pub(crate) fn open_chat(&self, label: &str) {
        self.send(PeerCommand::OpenChat(label.to_owned()));
    }

    pub(crate) fn arm_deadline(&mut self, deadline: JoinHandle<()>) {
        if let Some(previous) = self.deadline.replace(deadline) {
            previous.abort();
        }
    }

    /// New -> OfferSent.
    pub(crate) fn begin_offer(&mut self) -> Result<()> {
        if self.state != NegotiationState::New {
            return Err(Error::anomaly(format!(
                "cannot start an offer to {} in state {}",
                self.id, self.state
            )));
        }
        self.state = NegotiationState::OfferSent;
        self.local_signaled = false;
        self.send(PeerCommand::CreateOffer);
        Ok(())
    }

    pub(crate) fn offer_disposition(&self, polite: bool) -> OfferDisposition {
        match self.state {
            NegotiationState::New | NegotiationState::Answered | NegotiationState::Connected => {
                OfferDisposition::Accept
            }
            NegotiationState::OfferSent if polite && !self.answer_in_flight => OfferDisposition::Supersede,
            NegotiationState::OfferSent | NegotiationState::OfferReceived | NegotiationState::Closed => {
                OfferDisposition::Ignore
            }
        }
    }

    /// Stable state -> OfferReceived. The worker applies the offer and answers.
    pub(crate) fn receive_offer(&mut self, offer: SessionDescription) -> Result<()> {
        if !matches!(
            self.state,
            NegotiationState::New | NegotiationState::Answered | NegotiationState::Connected
        ) {
            return Err(Error::anomaly(format!(
                "offer from {} while in state {}",
                self.id, self.state
            )));
        }
        self.state = NegotiationState::OfferReceived;
        self.remote_applied = false;
        self.local_signaled = false;
        self.send(PeerCommand::AcceptOffer(offer));
        Ok(())
    }

    pub(crate) fn receive_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if self.state != NegotiationState::OfferSent || !self.local_signaled || self.answer_in_flight {
            return Err(Error::anomaly(format!(
                "unexpected answer from {} in state {}",
                self.id, self.state
            )));
        }
        self.answer_in_flight = true;
        self.send(PeerCommand::ApplyAnswer(answer));
        Ok(())
    }

    /// The worker produced our SDP. Returns the local candidates that were
    /// held back until it could be signaled.
    pub(crate) fn local_description_ready(&mut self, kind: SdpKind) -> Result<Vec<IceCandidate>> {
        match (kind, self.state) {
            (SdpKind::Offer, NegotiationState::OfferSent) => {}
            (SdpKind::Answer, NegotiationState::OfferReceived) => {
                self.state = NegotiationState::Answered;
            }
            (kind, state) => {
                return Err(Error::anomaly(format!(
                    "local {} for {} ready in state {}",
                    kind, self.id, state
                )))
            }
        }
        self.local_signaled = true;
        let held = self.held_local_candidates.drain(..).collect();
        self.promote();
        Ok(held)
    }

    /// Remote description is in place: flush buffered candidates in arrival order.
    pub(crate) fn remote_description_applied(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.remote_applied = true;
        if self.state == NegotiationState::OfferSent && self.answer_in_flight {
            self.answer_in_flight = false;
            self.enter_connected();
        }
        let pending: Vec<IceCandidate> = self.pending_candidates.drain(..).collect();
        for candidate in pending {
            self.send(PeerCommand::AddCandidate(candidate));
        }
        self.promote();
    }

    pub(crate) fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state == NegotiationState::Closed {
            return;
        }
        if self.remote_applied {
            self.send(PeerCommand::AddCandidate(candidate));
        } else {
            self.pending_candidates.push_back(candidate);
        }
    }

    /// Returns the candidate if it can be signaled now, otherwise holds it.
    pub(crate) fn local_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.state == NegotiationState::Closed {
            return None;
        }
        if self.local_signaled {
            Some(candidate)
        } else {
            self.held_local_candidates.push_back(candidate);
            None
        }
    }

    pub(crate) fn transport_state_changed(&mut self, state: TransportState) {
        match state {
            TransportState::Connected => {
                self.transport_connected = true;
                self.promote();
            }
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed => {
                self.transport_connected = false;
            }
            TransportState::New | TransportState::Connecting => {}
        }
    }

    fn promote(&mut self) {
        if self.state == NegotiationState::Answered && self.transport_connected {
            self.enter_connected();
        }
    }

    fn enter_connected(&mut self) {
        self.state = NegotiationState::Connected;
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }

    /// The first remote track opens the stream and returns it for delivery.
    /// Later tracks join that stream and return `None`.
    pub(crate) fn add_remote_track(&mut self, track: RemoteTrack) -> Option<RemoteStream> {
        if self.state == NegotiationState::Closed {
            return None;
        }
        match &self.remote_tracks {
            Some(tracks) => {
                tracks.send_if_modified(|list| {
                    if list.iter().any(|t| t.track_id == track.track_id) {
                        return false;
                    }
                    list.push(track);
                    true
                });
                None
            }
            None => {
                let (tracks, stream) = RemoteStream::open(track);
                self.remote_tracks = Some(tracks);
                Some(stream)
            }
        }
    }

    pub(crate) fn set_chat_open(&mut self, open: bool) {
        self.chat_open = open && self.state != NegotiationState::Closed;
    }

    pub(crate) fn send_chat(&self, text: &str) -> bool {
        if !self.chat_open || self.state == NegotiationState::Closed {
            return false;
        }
        self.send(PeerCommand::SendChat(text.to_owned()));
        true
    }

    /// Any state -> Closed. Returns false if already closed.
    pub(crate) fn close(&mut self) -> bool {
        if self.state == NegotiationState::Closed {
            return false;
        }
        self.state = NegotiationState::Closed;
        self.chat_open = false;
        self.pending_candidates.clear();
        self.held_local_candidates.clear();
        self.remote_tracks = None;
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
        self.send(PeerCommand::Close);
        true
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.close();
    }
}
