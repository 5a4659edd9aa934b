//! Room membership: the session façade, the event loop behind it, and the
//! registry that loop owns.

pub(crate) mod orchestrator;
pub(crate) mod registry;
mod session;

pub use session::{create_room, InviteState, RoomEvents, RoomSession, SessionContext};

use crate::media::LocalStream;
use crate::signaling::ParticipantId;
use crate::transport::RemoteStream;

/// Notifications for the renderer, delivered in order on [`RoomEvents`].
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Local capture is running; emitted once, before any remote stream.
    LocalStreamReady(LocalStream),
    /// First remote stream of a participant; at most once per connection.
    /// Tracks that arrive later are added to `stream` in place.
    RemoteTrackAvailable {
        peer: ParticipantId,
        stream: RemoteStream,
    },
    /// A remote participant left, disconnected, or failed to negotiate.
    PeerRemoved { peer: ParticipantId },
    ChatReady { peer: ParticipantId },
    ChatClosed { peer: ParticipantId },
    ChatMessage { peer: ParticipantId, text: String },
    /// Informational text from the signaling server.
    Notice(String),
    /// The signaling channel closed. Established connections keep running,
    /// but nobody new can join and nothing more will be signaled.
    SignalingLost,
}
