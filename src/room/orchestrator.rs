//! The room event loop.
//!
//! One task owns the [`ConnectionRegistry`] and is the only place it is
//! mutated. It multiplexes session commands, inbound signaling, and the
//! asynchronous results coming back from per-peer workers and transports.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::registry::ConnectionRegistry;
use super::RoomEvent;
use crate::config::NegotiationConfig;
use crate::connection::{NegotiationState, OfferDisposition, PeerConnection, PeerSummary, Role};
use crate::error::{Error, Result};
use crate::media::LocalTrack;
use crate::negotiation::{PeerWorker, StepOutcome};
use crate::signaling::{
    IceCandidate, ParticipantId, RoomId, SdpKind, SessionDescription, SignalMessage, SignalingClient,
};
use crate::transport::{TransportEvent, TransportEvents, TransportFactory};

/// Everything that re-enters the loop from a spawned task.
#[derive(Debug)]
pub(crate) enum LoopEvent {
    Transport {
        peer: ParticipantId,
        generation: u64,
        event: TransportEvent,
    },
    Step {
        peer: ParticipantId,
        generation: u64,
        outcome: StepOutcome,
    },
    Deadline {
        peer: ParticipantId,
        generation: u64,
    },
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    SendChat {
        text: String,
        reply: oneshot::Sender<usize>,
    },
    Leave {
        done: oneshot::Sender<()>,
    },
}

pub(crate) struct OrchestratorSetup {
    pub local_id: ParticipantId,
    pub room_id: RoomId,
    pub negotiation: NegotiationConfig,
    pub tracks: Vec<Arc<LocalTrack>>,
    pub transports: Arc<dyn TransportFactory>,
    pub signaling: SignalingClient,
    pub events: mpsc::UnboundedSender<RoomEvent>,
    pub commands: mpsc::UnboundedReceiver<SessionCommand>,
    pub snapshot: watch::Sender<Vec<PeerSummary>>,
}

pub(crate) struct ConnectionOrchestrator {
    local_id: ParticipantId,
    room_id: RoomId,
    negotiation: NegotiationConfig,
    registry: ConnectionRegistry,
    tracks: Vec<Arc<LocalTrack>>,
    transports: Arc<dyn TransportFactory>,
    signaling: SignalingClient,
    signaling_open: bool,
    outbox: Vec<SignalMessage>,
    events: mpsc::UnboundedSender<RoomEvent>,
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
    loop_rx: mpsc::UnboundedReceiver<LoopEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    snapshot: watch::Sender<Vec<PeerSummary>>,
    next_generation: u64,
}

impl ConnectionOrchestrator {
    pub(crate) fn new(setup: OrchestratorSetup) -> Self {
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        Self {
            registry: ConnectionRegistry::new(setup.negotiation.max_peers),
            local_id: setup.local_id,
            room_id: setup.room_id,
            negotiation: setup.negotiation,
            tracks: setup.tracks,
            transports: setup.transports,
            signaling: setup.signaling,
            signaling_open: true,
            outbox: Vec::new(),
            events: setup.events,
            loop_tx,
            loop_rx,
            commands: setup.commands,
            snapshot: setup.snapshot,
            next_generation: 0,
        }
    }

    /// Run until the session leaves. `backlog` holds signaling messages that
    /// arrived while the join handshake was still pending.
    pub(crate) async fn run(mut self, backlog: Vec<SignalMessage>) {
        info!(room = %self.room_id, peer = %self.local_id, "orchestrator started");
        for message in backlog {
            self.dispatch(message).await;
        }

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(SessionCommand::SendChat { text, reply }) => {
                        let _ = reply.send(self.broadcast_chat(&text));
                    }
                    Some(SessionCommand::Leave { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.loop_rx.recv() => {
                    let result = self.handle_loop_event(event);
                    self.report(result);
                    self.flush().await;
                    self.publish();
                }
                message = self.signaling.receive(), if self.signaling_open => match message {
                    Some(message) => self.dispatch(message).await,
                    None => self.signaling_lost(),
                },
            }
        }

        info!(room = %self.room_id, "orchestrator stopped");
    }

    async fn dispatch(&mut self, message: SignalMessage) {
        debug!(kind = message.kind(), "signaling message received");
        let result = self.handle_signal(message);
        self.report(result);
        self.flush().await;
        self.publish();
    }

    fn handle_signal(&mut self, message: SignalMessage) -> Result<()> {
        match message {
            SignalMessage::Invite { peer_id } => self.on_invite(peer_id),
            SignalMessage::Offer { peer_id, sdp } => self.on_offer(peer_id, sdp),
            SignalMessage::Answer { peer_id, sdp } => self.on_answer(peer_id, sdp),
            SignalMessage::Candidate { peer_id, candidate } => self.on_candidate(peer_id, candidate),
            SignalMessage::PeerLeft { peer_id, message } => self.on_peer_gone(peer_id, Some(message)),
            SignalMessage::PeerDisconnected { peer_id } => self.on_peer_gone(peer_id, None),
            SignalMessage::Error { message } => {
                warn!(room = %self.room_id, %message, "signaling server reported an error");
                self.emit(RoomEvent::Notice(message));
                Ok(())
            }
            other @ (SignalMessage::CreateRoom
            | SignalMessage::RoomCreated { .. }
            | SignalMessage::Join { .. }
            | SignalMessage::JoinReply { .. }
            | SignalMessage::Leave { .. }) => Err(Error::anomaly(format!(
                "unexpected {} message in an active room",
                other.kind()
            ))),
        }
    }

    fn on_invite(&mut self, peer: ParticipantId) -> Result<()> {
        if peer == self.local_id {
            return Err(Error::anomaly("invite addressed to ourselves"));
        }
        if self.registry.contains(&peer) {
            return Err(Error::anomaly(format!(
                "invite for {} which already has a connection",
                peer
            )));
        }
        self.spawn_peer(peer, Role::Offerer)?.begin_offer()
    }

    fn on_offer(&mut self, peer: ParticipantId, sdp: SessionDescription) -> Result<()> {
        if sdp.kind != SdpKind::Offer {
            return Err(Error::anomaly(format!("offer from {} carries an {}", peer, sdp.kind)));
        }

        let polite = self.is_polite(&peer);
        if let Some(pc) = self.registry.get_mut(&peer) {
            match pc.offer_disposition(polite) {
                OfferDisposition::Accept => return pc.receive_offer(sdp),
                OfferDisposition::Ignore => {
                    info!(%peer, state = %pc.state(), "glare: keeping our offer, ignoring theirs");
                    return Ok(());
                }
                OfferDisposition::Supersede => {
                    info!(%peer, "glare: withdrawing our offer in favour of theirs");
                }
            }
            self.registry.remove(&peer);
        }

        self.spawn_peer(peer, Role::Answerer)?.receive_offer(sdp)
    }

    fn on_answer(&mut self, peer: ParticipantId, sdp: SessionDescription) -> Result<()> {
        if sdp.kind != SdpKind::Answer {
            return Err(Error::anomaly(format!("answer from {} carries an {}", peer, sdp.kind)));
        }
        self.registry
            .get_mut(&peer)
            .ok_or_else(|| Error::anomaly(format!("answer from unknown peer {}", peer)))?
            .receive_answer(sdp)
    }

    fn on_candidate(&mut self, peer: ParticipantId, candidate: IceCandidate) -> Result<()> {
        self.registry
            .get_mut(&peer)
            .ok_or_else(|| Error::anomaly(format!("candidate from unknown peer {}", peer)))?
            .add_remote_candidate(candidate);
        Ok(())
    }

    fn on_peer_gone(&mut self, peer: ParticipantId, message: Option<String>) -> Result<()> {
        if self.registry.remove(&peer).is_none() {
            return Err(Error::anomaly(format!("{} left without a connection", peer)));
        }
        info!(%peer, "peer left the room");
        self.emit(RoomEvent::PeerRemoved { peer });
        if let Some(message) = message.filter(|m| !m.is_empty()) {
            self.emit(RoomEvent::Notice(message));
        }
        Ok(())
    }

    /// The participant with the lower id yields on glare.
    fn is_polite(&self, peer: &ParticipantId) -> bool {
        self.local_id < *peer
    }

    /// Create the entry, its worker and its deadline, and queue local media.
    fn spawn_peer(&mut self, peer: ParticipantId, role: Role) -> Result<&mut PeerConnection> {
        self.registry.ensure_vacant(&peer)?;
        self.next_generation += 1;
        let generation = self.next_generation;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let events = TransportEvents::new(peer.clone(), generation, self.loop_tx.clone());
        tokio::spawn(PeerWorker::new(Arc::clone(&self.transports), commands_rx, events).run());

        let mut pc = PeerConnection::new(peer.clone(), generation, role, commands_tx);
        for track in &self.tracks {
            pc.attach_track(track);
        }
        if role == Role::Offerer {
            pc.open_chat(&self.negotiation.chat_label);
        }
        if let Some(timeout) = self.negotiation.timeout() {
            pc.arm_deadline(self.deadline(peer.clone(), generation, timeout));
        }

        info!(%peer, ?role, generation, "peer connection created");
        self.registry.insert(pc)
    }

    fn deadline(&self, peer: ParticipantId, generation: u64, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let tx = self.loop_tx.clone();
        tokio::spawn(async move {
            sleep(timeout).await;
            let _ = tx.send(LoopEvent::Deadline { peer, generation });
        })
    }

    fn handle_loop_event(&mut self, event: LoopEvent) -> Result<()> {
        match event {
            LoopEvent::Transport {
                peer,
                generation,
                event,
            } => self.on_transport_event(peer, generation, event),
            LoopEvent::Step {
                peer,
                generation,
                outcome,
            } => self.on_step(peer, generation, outcome),
            LoopEvent::Deadline { peer, generation } => self.on_deadline(peer, generation),
        }
    }

    fn on_step(&mut self, peer: ParticipantId, generation: u64, outcome: StepOutcome) -> Result<()> {
        let Some(pc) = self.registry.current(&peer, generation) else {
            debug!(%peer, generation, ?outcome, "dropping stale negotiation step");
            return Ok(());
        };

        match outcome {
            StepOutcome::OfferCreated(sdp) => {
                let held = pc.local_description_ready(SdpKind::Offer)?;
                self.signal_local_description(peer, sdp, held);
            }
            StepOutcome::AnswerCreated(sdp) => {
                let held = pc.local_description_ready(SdpKind::Answer)?;
                self.signal_local_description(peer, sdp, held);
            }
            StepOutcome::RemoteApplied => pc.remote_description_applied(),
            StepOutcome::Failed(reason) => self.fail_peer(peer, reason),
        }
        Ok(())
    }

    fn signal_local_description(&mut self, peer: ParticipantId, sdp: SessionDescription, held: Vec<IceCandidate>) {
        let message = match sdp.kind {
            SdpKind::Offer => SignalMessage::Offer {
                peer_id: peer.clone(),
                sdp,
            },
            SdpKind::Answer => SignalMessage::Answer {
                peer_id: peer.clone(),
                sdp,
            },
        };
        self.outbox.push(message);
        self.outbox
            .extend(held.into_iter().map(|candidate| SignalMessage::Candidate {
                peer_id: peer.clone(),
                candidate,
            }));
    }

    fn on_transport_event(&mut self, peer: ParticipantId, generation: u64, event: TransportEvent) -> Result<()> {
        let Some(pc) = self.registry.current(&peer, generation) else {
            debug!(%peer, generation, "dropping event from a closed transport");
            return Ok(());
        };

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Some(candidate) = pc.local_candidate(candidate) {
                    self.outbox.push(SignalMessage::Candidate {
                        peer_id: peer,
                        candidate,
                    });
                }
            }
            TransportEvent::RemoteTrack(track) => {
                let (kind, track_id) = (track.kind, track.track_id.clone());
                match pc.add_remote_track(track) {
                    Some(stream) => {
                        info!(%peer, %kind, track = %track_id, "remote stream available");
                        self.emit(RoomEvent::RemoteTrackAvailable { peer, stream });
                    }
                    None => debug!(%peer, %kind, track = %track_id, "track added to the delivered stream"),
                }
            }
            TransportEvent::ChatOpened { label } => {
                pc.set_chat_open(true);
                info!(%peer, %label, "chat channel open");
                self.emit(RoomEvent::ChatReady { peer });
            }
            TransportEvent::ChatClosed => {
                let was_open = pc.is_chat_open();
                pc.set_chat_open(false);
                if was_open {
                    self.emit(RoomEvent::ChatClosed { peer });
                }
            }
            TransportEvent::ChatMessage(text) => self.emit(RoomEvent::ChatMessage { peer, text }),
            TransportEvent::StateChanged(state) => {
                info!(%peer, %state, "peer connection state has changed");
                pc.transport_state_changed(state);
            }
        }
        Ok(())
    }

    fn on_deadline(&mut self, peer: ParticipantId, generation: u64) -> Result<()> {
        let Some(pc) = self.registry.current(&peer, generation) else {
            return Ok(());
        };
        let state = pc.state();
        if state == NegotiationState::Connected {
            return Ok(());
        }
        let waited = self.negotiation.timeout_ms.unwrap_or_default();
        self.fail_peer(peer, format!("not connected within {} ms (stuck in {})", waited, state));
        Ok(())
    }

    /// Negotiation failures only ever take down the affected peer.
    fn fail_peer(&mut self, peer: ParticipantId, reason: String) {
        if self.registry.remove(&peer).is_none() {
            return;
        }
        let error = Error::NegotiationFailure {
            peer: peer.clone(),
            reason,
        };
        warn!(%error, "closing peer connection");
        self.emit(RoomEvent::PeerRemoved { peer });
    }

    fn broadcast_chat(&self, text: &str) -> usize {
        self.registry.iter().filter(|pc| pc.send_chat(text)).count()
    }

    async fn shutdown(&mut self) {
        let closed = self.registry.drain().len();
        self.outbox.clear();
        self.publish();
        info!(room = %self.room_id, closed, "leaving room");

        if self.signaling_open {
            let leave = SignalMessage::Leave {
                room_id: self.room_id.clone(),
            };
            if let Err(e) = self.signaling.send(leave).await {
                warn!(error = %e, "could not announce leave");
            }
        }
    }

    fn signaling_lost(&mut self) {
        if !self.signaling_open {
            return;
        }
        self.signaling_open = false;
        self.outbox.clear();
        warn!(room = %self.room_id, "signaling channel lost; existing connections stay up");
        self.emit(RoomEvent::SignalingLost);
    }

    async fn flush(&mut self) {
        for message in std::mem::take(&mut self.outbox) {
            if !self.signaling_open {
                debug!(kind = message.kind(), "signaling closed, dropping outbound message");
                continue;
            }
            if let Err(e) = self.signaling.send(message).await {
                warn!(error = %e, "signaling send failed");
                self.signaling_lost();
            }
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.registry.summaries());
    }

    fn emit(&self, event: RoomEvent) {
        if self.events.send(event).is_err() {
            debug!("room event receiver dropped");
        }
    }

    fn report(&self, result: Result<()>) {
        match result {
            Ok(()) => {}
            Err(Error::ProtocolAnomaly(reason)) => debug!(%reason, "protocol anomaly, message dropped"),
            Err(Error::RoomFull(max)) => warn!(max, "room is full, not connecting"),
            Err(e) => warn!(error = %e, "failed to handle room event"),
        }
    }
}
