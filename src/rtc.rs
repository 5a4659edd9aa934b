//! `webrtc` crate implementation of the transport seam.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::config::ClientConfig;
use crate::data_channel::DataChannelBridge;
use crate::error::Result;
use crate::media::{LocalTrack, TrackKind};
use crate::signaling::{IceCandidate, ParticipantId, SdpKind, SessionDescription};
use crate::transport::{
    PeerTransport, RemoteTrack, TransportEvent, TransportEvents, TransportFactory, TransportState,
};

/// Builds one `RTCPeerConnection` per remote participant from a shared API.
pub struct RtcTransportFactory {
    api: API,
    rtc_config: RTCConfiguration,
}

impl RtcTransportFactory {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        // Create a MediaEngine object to configure the supported codec
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        Ok(Self { api, rtc_config })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self, peer: &ParticipantId, events: TransportEvents) -> Result<Arc<dyn PeerTransport>> {
        let pc = Arc::new(self.api.new_peer_connection(self.rtc_config.clone()).await?);
        debug!(%peer, "peer connection created");

        let transport = RtcTransport {
            chat: DataChannelBridge::new(events.clone()),
            pc,
            events,
        };
        transport.setup_event_handlers();
        Ok(Arc::new(transport))
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    chat: DataChannelBridge,
    events: TransportEvents,
}

impl RtcTransport {
    fn setup_event_handlers(&self) {
        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    // `None` marks the end of gathering.
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            debug!("ICE candidate: {}", init.candidate);
                            events.emit(TransportEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => debug!(error = %e, "failed to serialize ICE candidate"),
                    }
                })
            }));

        let events = self.events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let events = events.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => TrackKind::Video,
                        _ => TrackKind::Audio,
                    };
                    events.emit(TransportEvent::RemoteTrack(RemoteTrack {
                        stream_id: track.stream_id(),
                        track_id: track.id(),
                        kind,
                        track: Some(track),
                    }));
                })
            },
        ));

        let chat = self.chat.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let chat = chat.clone();
                Box::pin(async move {
                    chat.attach(dc).await;
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => TransportState::New,
                        RTCPeerConnectionState::Connecting => TransportState::Connecting,
                        RTCPeerConnectionState::Connected => TransportState::Connected,
                        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                        RTCPeerConnectionState::Failed => TransportState::Failed,
                        RTCPeerConnectionState::Closed => TransportState::Closed,
                        _ => return,
                    };
                    events.emit(TransportEvent::StateChanged(state));
                })
            }));

        let peer = self.events.peer().clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                info!(%peer, "ICE connection state has changed: {}", s);
                Box::pin(async {})
            }));

        let peer = self.events.peer().clone();
        self.pc
            .on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
                debug!(%peer, "signaling state has changed: {}", s);
                Box::pin(async {})
            }));
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        let sender = self.pc.add_track(track.rtc_track()).await?;

        // Drain RTCP so interceptors (NACK, reports) keep working.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
        });
        Ok(())
    }

    async fn open_data_channel(&self, label: &str) -> Result<()> {
        let dc = self.pc.create_data_channel(label, None).await?;
        self.chat.attach(dc).await;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        };
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn send_chat(&self, text: &str) -> Result<()> {
        self.chat.send(text).await
    }

    async fn close(&self) -> Result<()> {
        self.chat.close().await;
        self.pc.close().await?;
        Ok(())
    }
}
