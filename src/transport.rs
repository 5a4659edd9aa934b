//! Seam between the orchestrator and the engine that actually negotiates
//! ICE/SDP with one remote participant.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;
use crate::media::{LocalTrack, TrackKind};
use crate::negotiation::StepOutcome;
use crate::room::orchestrator::LoopEvent;
use crate::signaling::{IceCandidate, ParticipantId, SessionDescription};

/// Connectivity as reported by the engine. Diagnostic only, except that
/// `Connected` completes the answerer side of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::New => write!(f, "new"),
            TransportState::Connecting => write!(f, "connecting"),
            TransportState::Connected => write!(f, "connected"),
            TransportState::Disconnected => write!(f, "disconnected"),
            TransportState::Failed => write!(f, "failed"),
            TransportState::Closed => write!(f, "closed"),
        }
    }
}

/// One track the engine received from a remote participant.
#[derive(Clone)]
pub struct RemoteTrack {
    pub stream_id: String,
    pub track_id: String,
    pub kind: TrackKind,
    /// The engine's track handle; absent for engines without RTP access.
    pub track: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// A participant's media as handed to the renderer.
///
/// The handle is delivered once per connection and keeps growing: tracks
/// the engine reports later are added to it rather than announced again.
#[derive(Clone)]
pub struct RemoteStream {
    stream_id: String,
    tracks: watch::Receiver<Vec<RemoteTrack>>,
}

impl RemoteStream {
    /// Start a stream from its first track. The sender stays with the
    /// connection that owns the stream.
    pub(crate) fn open(first: RemoteTrack) -> (watch::Sender<Vec<RemoteTrack>>, Self) {
        let stream_id = first.stream_id.clone();
        let (tx, rx) = watch::channel(vec![first]);
        (tx, Self { stream_id, tracks: rx })
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Every track received so far, in arrival order.
    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.borrow().clone()
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.borrow().iter().map(|t| t.track_id.clone()).collect()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.borrow().iter().any(|t| t.kind == kind)
    }

    /// Wait for another track. Returns false once the connection is gone.
    pub async fn changed(&mut self) -> bool {
        self.tracks.changed().await.is_ok()
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("stream_id", &self.stream_id)
            .field("tracks", &self.track_ids())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    ChatOpened { label: String },
    ChatClosed,
    ChatMessage(String),
    StateChanged(TransportState),
}

/// Callback sink for one transport. Every event is tagged with the owning
/// connection's generation so the orchestrator can drop stale ones.
#[derive(Clone)]
pub struct TransportEvents {
    peer: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl TransportEvents {
    pub(crate) fn new(peer: ParticipantId, generation: u64, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self { peer, generation, tx }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    /// Returns false once the room loop is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(LoopEvent::Transport {
                peer: self.peer.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub(crate) fn step(&self, outcome: StepOutcome) {
        let _ = self.tx.send(LoopEvent::Step {
            peer: self.peer.clone(),
            generation: self.generation,
            outcome,
        });
    }
}

/// One negotiation session with one remote participant.
///
/// `create_offer`/`create_answer` also apply the result as the local description.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<()>;

    /// Open the chat channel as offerer. The answerer gets it through the
    /// engine's incoming-channel callback instead.
    async fn open_data_channel(&self, label: &str) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn send_chat(&self, text: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, peer: &ParticipantId, events: TransportEvents) -> Result<Arc<dyn PeerTransport>>;
}
