//! Chat data channel plumbing shared by both negotiation roles.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

use crate::error::{Error, Result};
use crate::transport::{TransportEvent, TransportEvents};

/// Holds the chat channel of one connection.
///
/// The offerer attaches the channel it created, the answerer attaches the one
/// announced by the remote side. Both go through [`DataChannelBridge::attach`],
/// so handlers are wired identically whichever role the connection ended up in.
#[derive(Clone)]
pub struct DataChannelBridge {
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    events: TransportEvents,
}

impl DataChannelBridge {
    pub fn new(events: TransportEvents) -> Self {
        Self {
            channel: Arc::new(RwLock::new(None)),
            events,
        }
    }

    pub async fn attach(&self, dc: Arc<RTCDataChannel>) {
        let label = dc.label().to_owned();
        info!(peer = %self.events.peer(), %label, "data channel attached");

        let events = self.events.clone();
        let open_label = label.clone();
        dc.on_open(Box::new(move || {
            let events = events.clone();
            let label = open_label.clone();
            Box::pin(async move {
                events.emit(TransportEvent::ChatOpened { label });
            })
        }));

        let events = self.events.clone();
        dc.on_close(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                events.emit(TransportEvent::ChatClosed);
            })
        }));

        let events = self.events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        events.emit(TransportEvent::ChatMessage(text));
                    }
                    Err(_) => debug!("DataChannel binary message ignored: {} bytes", msg.data.len()),
                }
            })
        }));

        if let Some(previous) = self.channel.write().await.replace(dc) {
            debug!(label = previous.label(), "replacing data channel");
        }
    }

    pub async fn send(&self, text: &str) -> Result<()> {
        let guard = self.channel.read().await;
        let dc = guard
            .as_ref()
            .ok_or_else(|| Error::anomaly("chat channel is not attached"))?;
        dc.send_text(text.to_owned()).await?;
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(dc) = self.channel.write().await.take() {
            if let Err(e) = dc.close().await {
                debug!(error = %e, "data channel close failed");
            }
        }
    }
}
