//! Signaling wire format and the room-scoped signaling channel.
//!
//! The same tagged message type travels in both directions. `peer_id` always
//! names the *other* party: the target when sent, the origin when received.

use std::fmt;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const CHANNEL_CAPACITY: usize = 100;

/// Identity of a room member, assigned by the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// SDP offer or answer, shaped like the browser's `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    CreateRoom,
    RoomCreated {
        room_id: RoomId,
    },
    Join {
        room_id: RoomId,
    },
    JoinReply {
        accepted: bool,
        room_id: RoomId,
        /// Id the server assigned to this client; absent when rejected.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<ParticipantId>,
        #[serde(default)]
        message: String,
    },
    /// Asks an existing member to start negotiating with a newcomer.
    Invite {
        peer_id: ParticipantId,
    },
    Offer {
        peer_id: ParticipantId,
        sdp: SessionDescription,
    },
    Answer {
        peer_id: ParticipantId,
        sdp: SessionDescription,
    },
    Candidate {
        peer_id: ParticipantId,
        candidate: IceCandidate,
    },
    Leave {
        room_id: RoomId,
    },
    PeerLeft {
        peer_id: ParticipantId,
        #[serde(default)]
        message: String,
    },
    PeerDisconnected {
        peer_id: ParticipantId,
    },
    Error {
        message: String,
    },
}

impl SignalMessage {
    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::CreateRoom => "create_room",
            SignalMessage::RoomCreated { .. } => "room_created",
            SignalMessage::Join { .. } => "join",
            SignalMessage::JoinReply { .. } => "join_reply",
            SignalMessage::Invite { .. } => "invite",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
            SignalMessage::Leave { .. } => "leave",
            SignalMessage::PeerLeft { .. } => "peer_left",
            SignalMessage::PeerDisconnected { .. } => "peer_disconnected",
            SignalMessage::Error { .. } => "error",
        }
    }
}

/// Reliable, ordered, full-duplex channel to the signaling server.
pub struct SignalingClient {
    tx: mpsc::Sender<SignalMessage>,
    rx: mpsc::Receiver<SignalMessage>,
}

impl SignalingClient {
    /// Connect to a WebSocket signaling server speaking JSON `SignalMessage`s.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::SignalingUnavailable(format!("{}: {}", url, e)))?;
        let (mut write, mut read) = ws_stream.split();
        info!("Connected to signaling server at {}", url);

        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<SignalMessage>(CHANNEL_CAPACITY);

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, kind = msg.kind(), "failed to encode signaling message");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!(error = %e, "signaling write failed");
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(&text) {
                        Ok(signal) => {
                            if incoming_tx.send(signal).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping malformed signaling frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "signaling read failed");
                        break;
                    }
                }
            }
            debug!("signaling read loop finished");
        });

        Ok(Self::from_channels(outgoing_tx, incoming_rx))
    }

    /// Wrap an already established channel pair (in-process servers, tests).
    pub fn from_channels(tx: mpsc::Sender<SignalMessage>, rx: mpsc::Receiver<SignalMessage>) -> Self {
        Self { tx, rx }
    }

    pub async fn send(&self, msg: SignalMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|e| Error::SignalingUnavailable(format!("failed to send {}: channel closed", e.0.kind())))
    }

    /// Next inbound message; `None` once the server side is gone.
    pub async fn receive(&mut self) -> Option<SignalMessage> {
        self.rx.recv().await
    }
}
