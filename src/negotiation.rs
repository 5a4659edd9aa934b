//! Per-peer negotiation worker.
//!
//! Each connection gets one task that owns its transport and runs commands
//! strictly in order, so a candidate queued after a remote description is
//! never applied before it. Results go back to the room loop as
//! [`StepOutcome`]s; the loop decides whether they are still relevant.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::media::LocalTrack;
use crate::signaling::{IceCandidate, ParticipantId, SessionDescription};
use crate::transport::{PeerTransport, TransportEvents, TransportFactory};

#[derive(Debug)]
pub(crate) enum PeerCommand {
    AddTrack(Arc<LocalTrack>),
    OpenChat(String),
    CreateOffer,
    /// Apply a remote offer, then create and apply the answer.
    AcceptOffer(SessionDescription),
    ApplyAnswer(SessionDescription),
    AddCandidate(IceCandidate),
    SendChat(String),
    Close,
}

#[derive(Debug)]
pub(crate) enum StepOutcome {
    OfferCreated(SessionDescription),
    AnswerCreated(SessionDescription),
    RemoteApplied,
    Failed(String),
}

pub(crate) struct PeerWorker {
    peer: ParticipantId,
    factory: Arc<dyn TransportFactory>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    events: TransportEvents,
}

impl PeerWorker {
    pub(crate) fn new(
        factory: Arc<dyn TransportFactory>,
        commands: mpsc::UnboundedReceiver<PeerCommand>,
        events: TransportEvents,
    ) -> Self {
        Self {
            peer: events.peer().clone(),
            factory,
            commands,
            events,
        }
    }

    pub(crate) async fn run(mut self) {
        let transport = match self.factory.create(&self.peer, self.events.clone()).await {
            Ok(transport) => transport,
            Err(e) => {
                self.events
                    .step(StepOutcome::Failed(format!("transport setup failed: {}", e)));
                return;
            }
        };

        while let Some(command) = self.commands.recv().await {
            if matches!(command, PeerCommand::Close) {
                break;
            }
            if let Err(e) = self.execute(transport.as_ref(), command).await {
                self.events.step(StepOutcome::Failed(e.to_string()));
                break;
            }
        }

        if let Err(e) = transport.close().await {
            debug!(peer = %self.peer, error = %e, "transport close failed");
        }
        debug!(peer = %self.peer, "negotiation worker finished");
    }

    async fn execute(&self, transport: &dyn PeerTransport, command: PeerCommand) -> Result<()> {
        match command {
            PeerCommand::AddTrack(track) => transport.add_track(track).await,
            PeerCommand::OpenChat(label) => transport.open_data_channel(&label).await,
            PeerCommand::CreateOffer => {
                let offer = transport.create_offer().await?;
                self.events.step(StepOutcome::OfferCreated(offer));
                Ok(())
            }
            PeerCommand::AcceptOffer(offer) => {
                transport.set_remote_description(offer).await?;
                self.events.step(StepOutcome::RemoteApplied);
                let answer = transport.create_answer().await?;
                self.events.step(StepOutcome::AnswerCreated(answer));
                Ok(())
            }
            PeerCommand::ApplyAnswer(answer) => {
                transport.set_remote_description(answer).await?;
                self.events.step(StepOutcome::RemoteApplied);
                Ok(())
            }
            // A bad candidate costs one path, not the connection.
            PeerCommand::AddCandidate(candidate) => {
                if let Err(e) = transport.add_ice_candidate(candidate).await {
                    warn!(peer = %self.peer, error = %e, "failed to add remote ICE candidate");
                }
                Ok(())
            }
            PeerCommand::SendChat(text) => {
                if let Err(e) = transport.send_chat(&text).await {
                    warn!(peer = %self.peer, error = %e, "failed to send chat message");
                }
                Ok(())
            }
            PeerCommand::Close => Ok(()),
        }
    }
}
