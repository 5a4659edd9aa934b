//! Full-mesh audio/video rooms over WebRTC.
//!
//! A [`RoomSession`] joins a room through a signaling server and keeps one
//! peer connection per remote participant. The WebRTC engine and capture
//! devices sit behind the [`TransportFactory`] and [`MediaDevices`] traits;
//! [`RtcTransportFactory`] and [`SyntheticDevices`] are the built-in ones.

pub mod config;
pub mod connection;
pub mod data_channel;
pub mod error;
pub mod media;
pub(crate) mod negotiation;
pub mod room;
pub mod rtc;
pub mod signaling;
pub mod transport;

pub use config::ClientConfig;
pub use connection::{NegotiationState, PeerSummary, Role};
pub use error::{Error, MediaDenial, Result, RetryAdvice};
pub use media::{LocalStream, LocalTrack, MediaDevices, MediaError, SyntheticDevices, TrackKind};
pub use room::{create_room, InviteState, RoomEvent, RoomEvents, RoomSession, SessionContext};
pub use rtc::RtcTransportFactory;
pub use signaling::{IceCandidate, ParticipantId, RoomId, SdpKind, SessionDescription, SignalMessage, SignalingClient};
pub use transport::{
    PeerTransport, RemoteStream, RemoteTrack, TransportEvent, TransportEvents, TransportFactory, TransportState,
};
