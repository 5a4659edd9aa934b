use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::orchestrator::{ConnectionOrchestrator, OrchestratorSetup, SessionCommand};
use super::RoomEvent;
use crate::config::ClientConfig;
use crate::connection::PeerSummary;
use crate::error::{Error, MediaDenial, Result};
use crate::media::{LocalMediaSource, MediaDevices};
use crate::signaling::{ParticipantId, RoomId, SignalMessage, SignalingClient};
use crate::transport::TransportFactory;

pub type RoomEvents = mpsc::UnboundedReceiver<RoomEvent>;

/// The pluggable pieces a session is built from.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<ClientConfig>,
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InviteState {
    pub muted: bool,
    /// Local participant included; zero once the session has left.
    pub participant_count: usize,
}

struct JoinReply {
    accepted: bool,
    peer_id: Option<ParticipantId>,
    message: String,
}

/// Membership in one room.
///
/// Owns the local capture for its whole lifetime and talks to the
/// orchestrator task that manages the peer connections.
pub struct RoomSession {
    room_id: RoomId,
    local_id: ParticipantId,
    join_message: String,
    media: LocalMediaSource,
    commands: mpsc::UnboundedSender<SessionCommand>,
    peers: watch::Receiver<Vec<PeerSummary>>,
    task: Option<JoinHandle<()>>,
    muted: bool,
    left: bool,
}

impl RoomSession {
    /// Acquire local media, ask the server to join `room_id`, and start
    /// negotiating with whoever is already there.
    ///
    /// `attempt` is the 1-based number of this join attempt; it decides
    /// whether a media denial is still retryable.
    pub async fn join(
        room_id: impl Into<RoomId>,
        attempt: u32,
        mut signaling: SignalingClient,
        ctx: SessionContext,
    ) -> Result<(Self, RoomEvents)> {
        let room_id = room_id.into();
        let config = Arc::clone(&ctx.config);

        let media = LocalMediaSource::acquire(ctx.devices.as_ref(), &config.media)
            .await
            .map_err(|cause| {
                let denial = MediaDenial::classify(cause, attempt, config.media.max_access_attempts);
                warn!(room = %room_id, %denial, "local media unavailable");
                Error::MediaAccessDenied(denial)
            })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(RoomEvent::LocalStreamReady(media.stream()));

        signaling
            .send(SignalMessage::Join {
                room_id: room_id.clone(),
            })
            .await?;
        let (reply, backlog) = await_join_reply(&mut signaling, config.join_timeout()).await?;

        let JoinReply {
            accepted,
            peer_id,
            message: join_message,
        } = reply;
        let local_id = match (accepted, peer_id) {
            (true, Some(id)) => id,
            (true, None) => return Err(Error::anomaly("join accepted without a participant id")),
            (false, _) => {
                return Err(Error::UnknownRoom {
                    room: room_id.to_string(),
                    message: join_message,
                })
            }
        };
        info!(room = %room_id, peer = %local_id, backlog = backlog.len(), "joined room");
        if !join_message.is_empty() {
            let _ = events_tx.send(RoomEvent::Notice(join_message.clone()));
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Vec::new());
        let orchestrator = ConnectionOrchestrator::new(OrchestratorSetup {
            local_id: local_id.clone(),
            room_id: room_id.clone(),
            negotiation: config.negotiation.clone(),
            tracks: media.tracks().to_vec(),
            transports: ctx.transports,
            signaling,
            events: events_tx,
            commands: commands_rx,
            snapshot: snapshot_tx,
        });
        let task = tokio::spawn(orchestrator.run(backlog));

        let session = Self {
            room_id,
            local_id,
            join_message,
            media,
            commands: commands_tx,
            peers: snapshot_rx,
            task: Some(task),
            muted: false,
            left: false,
        };
        Ok((session, events_rx))
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Informational text that came with the join reply.
    pub fn join_message(&self) -> &str {
        &self.join_message
    }

    pub fn has_left(&self) -> bool {
        self.left
    }

    /// Enable or disable outbound audio on every connection at once.
    pub fn set_muted(&mut self, muted: bool) {
        self.media.set_audio_enabled(!muted);
        self.muted = muted;
        info!(room = %self.room_id, muted, "microphone state changed");
    }

    pub fn invite_state(&self) -> InviteState {
        let participant_count = if self.left {
            0
        } else {
            self.peers.borrow().len() + 1
        };
        InviteState {
            muted: self.muted,
            participant_count,
        }
    }

    /// Remote participants with a live connection entry.
    pub fn peers(&self) -> Vec<PeerSummary> {
        if self.left {
            return Vec::new();
        }
        self.peers.borrow().clone()
    }

    /// Send a chat line on every open channel. Returns how many peers it went to.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<usize> {
        if self.left {
            return Ok(0);
        }
        let (reply, delivered) = oneshot::channel();
        let command = SessionCommand::SendChat {
            text: text.into(),
            reply,
        };
        if self.commands.send(command).is_err() {
            return Ok(0);
        }
        Ok(delivered.await.unwrap_or(0))
    }

    /// Close every connection, announce the departure and stop local media.
    /// Calling it again does nothing.
    pub async fn leave(&mut self) {
        if self.left {
            debug!(room = %self.room_id, "leave on a session that already left");
            return;
        }
        self.left = true;

        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(SessionCommand::Leave { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "room loop ended abnormally");
            }
        }
        self.media.stop();
        info!(room = %self.room_id, "left room");
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        if !self.left {
            let (done, _) = oneshot::channel();
            let _ = self.commands.send(SessionCommand::Leave { done });
        }
        self.media.stop();
    }
}

async fn await_join_reply(
    signaling: &mut SignalingClient,
    wait: Duration,
) -> Result<(JoinReply, Vec<SignalMessage>)> {
    let mut backlog = Vec::new();
    let reply = timeout(wait, async {
        while let Some(message) = signaling.receive().await {
            match message {
                SignalMessage::JoinReply {
                    accepted,
                    peer_id,
                    message,
                    ..
                } => {
                    return Some(JoinReply {
                        accepted,
                        peer_id,
                        message,
                    })
                }
                other => {
                    debug!(kind = other.kind(), "queued until the join completes");
                    backlog.push(other);
                }
            }
        }
        None
    })
    .await;

    match reply {
        Ok(Some(reply)) => Ok((reply, backlog)),
        Ok(None) => Err(Error::SignalingUnavailable(
            "signaling closed before the join was answered".into(),
        )),
        Err(_) => Err(Error::SignalingUnavailable(format!(
            "no join reply within {} ms",
            wait.as_millis()
        ))),
    }
}

/// Ask the signaling server for a fresh room.
pub async fn create_room(signaling: &mut SignalingClient, wait: Duration) -> Result<RoomId> {
    signaling.send(SignalMessage::CreateRoom).await?;
    let created = timeout(wait, async {
        while let Some(message) = signaling.receive().await {
            match message {
                SignalMessage::RoomCreated { room_id } => return Ok(room_id),
                SignalMessage::Error { message } => {
                    return Err(Error::SignalingUnavailable(format!(
                        "room creation refused: {}",
                        message
                    )))
                }
                other => debug!(kind = other.kind(), "ignored while creating a room"),
            }
        }
        Err(Error::SignalingUnavailable(
            "signaling closed before the room was created".into(),
        ))
    })
    .await;

    let room_id = created
        .map_err(|_| Error::SignalingUnavailable(format!("no reply within {} ms", wait.as_millis())))??;
    info!(room = %room_id, "room created");
    Ok(room_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (SignalingClient, mpsc::Sender<SignalMessage>, mpsc::Receiver<SignalMessage>) {
        let (to_server, from_client) = mpsc::channel(16);
        let (to_client, from_server) = mpsc::channel(16);
        (SignalingClient::from_channels(to_server, from_server), to_client, from_client)
    }

    #[tokio::test]
    async fn messages_before_the_reply_are_kept() {
        let (mut signaling, server, _outbound) = client();
        server.send(SignalMessage::Invite { peer_id: "u3".into() }).await.unwrap();
        server
            .send(SignalMessage::JoinReply {
                accepted: true,
                room_id: "R1".into(),
                peer_id: Some("u2".into()),
                message: "welcome".into(),
            })
            .await
            .unwrap();

        let (reply, backlog) = await_join_reply(&mut signaling, Duration::from_secs(1)).await.unwrap();
        assert!(reply.accepted);
        assert_eq!(reply.peer_id, Some("u2".into()));
        assert_eq!(reply.message, "welcome");
        assert_eq!(backlog, vec![SignalMessage::Invite { peer_id: "u3".into() }]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out() {
        let (mut signaling, _server, _outbound) = client();
        let err = await_join_reply(&mut signaling, Duration::from_millis(500))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::SignalingUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn error_reply_fails_room_creation() {
        let (mut signaling, server, mut outbound) = client();
        server
            .send(SignalMessage::Error {
                message: "rate limited".into(),
            })
            .await
            .unwrap();

        let err = create_room(&mut signaling, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains("rate limited"));
        assert_eq!(outbound.recv().await, Some(SignalMessage::CreateRoom));
    }

    #[tokio::test]
    async fn closed_channel_fails_room_creation() {
        let (mut signaling, server, mut outbound) = client();
        drop(server);

        let err = create_room(&mut signaling, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::SignalingUnavailable(_)));
        assert!(err.to_string().contains("closed before the room was created"));
        assert_eq!(outbound.recv().await, Some(SignalMessage::CreateRoom));
    }

    #[tokio::test]
    async fn closed_channel_fails_the_join() {
        let (mut signaling, server, _outbound) = client();
        drop(server);

        let err = await_join_reply(&mut signaling, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::SignalingUnavailable(_)));
    }
}
