#![allow(dead_code)]

//! In-process signaling hub and a scripted transport engine for room tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use mesh_call::media::SampleSource;
use mesh_call::{
    ClientConfig, Error, IceCandidate, LocalTrack, MediaDevices, MediaError, ParticipantId, PeerSummary,
    PeerTransport, RemoteTrack, Result, RoomEvent, RoomEvents, RoomId, RoomSession, SdpKind, SessionContext,
    SessionDescription, SignalMessage, SignalingClient, SyntheticDevices, TrackKind, TransportEvent,
    TransportEvents, TransportFactory, TransportState,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Signaling server stand-in. Forwards offers/answers/candidates with the
/// `peer_id` rewritten to the sender, the way a real relay does.
#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<Mutex<HubState>>,
}

#[derive(Default)]
struct HubState {
    rooms: HashMap<RoomId, Vec<ParticipantId>>,
    clients: HashMap<ParticipantId, mpsc::Sender<SignalMessage>>,
    sent: Vec<(ParticipantId, SignalMessage)>,
    delivered: Vec<(ParticipantId, SignalMessage)>,
    next_room: u32,
}

impl HubState {
    fn deliver(&mut self, to: &ParticipantId, message: SignalMessage) {
        if let Some(tx) = self.clients.get(to) {
            if tx.try_send(message.clone()).is_ok() {
                self.delivered.push((to.clone(), message));
            }
        }
    }

    fn room_of(&self, id: &ParticipantId) -> Option<RoomId> {
        self.rooms
            .iter()
            .find(|(_, members)| members.contains(id))
            .map(|(room, _)| room.clone())
    }

    /// Take `id` out of its room and tell whoever is left.
    fn depart(&mut self, id: &ParticipantId, notice: impl Fn(&ParticipantId) -> SignalMessage) {
        let Some(room) = self.room_of(id) else { return };
        let remaining = match self.rooms.get_mut(&room) {
            Some(members) => {
                members.retain(|m| m != id);
                members.clone()
            }
            None => return,
        };
        for member in remaining {
            self.deliver(&member, notice(id));
        }
    }
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_room(&self, room: &str) {
        self.lock().rooms.insert(room.into(), Vec::new());
    }

    /// Attach a client; the server will know it as `id`.
    pub fn connect(&self, id: &str) -> SignalingClient {
        let id = ParticipantId::from(id);
        let (client_tx, mut server_rx) = mpsc::channel(256);
        let (server_tx, client_rx) = mpsc::channel(256);
        self.lock().clients.insert(id.clone(), server_tx);

        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(message) = server_rx.recv().await {
                hub.route(&id, message);
            }
            // client dropped its half without leaving
            let mut state = hub.lock();
            state.depart(&id, |gone| SignalMessage::PeerDisconnected { peer_id: gone.clone() });
        });

        SignalingClient::from_channels(client_tx, client_rx)
    }

    /// Cut a client off: its signaling closes and its room mates hear about it.
    pub fn disconnect(&self, id: &str) {
        let id = ParticipantId::from(id);
        let mut state = self.lock();
        state.clients.remove(&id);
        state.depart(&id, |gone| SignalMessage::PeerDisconnected { peer_id: gone.clone() });
    }

    /// Deliver a raw message, bypassing routing.
    pub fn inject(&self, to: &str, message: SignalMessage) {
        self.lock().deliver(&to.into(), message);
    }

    pub fn sent_by(&self, id: &str) -> Vec<SignalMessage> {
        let id = ParticipantId::from(id);
        self.lock()
            .sent
            .iter()
            .filter(|(from, _)| *from == id)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn delivered_to(&self, id: &str) -> Vec<SignalMessage> {
        let id = ParticipantId::from(id);
        self.lock()
            .delivered
            .iter()
            .filter(|(to, _)| *to == id)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn all_delivered(&self) -> Vec<SignalMessage> {
        self.lock().delivered.iter().map(|(_, m)| m.clone()).collect()
    }

    fn route(&self, from: &ParticipantId, message: SignalMessage) {
        let mut state = self.lock();
        state.sent.push((from.clone(), message.clone()));

        match message {
            SignalMessage::CreateRoom => {
                state.next_room += 1;
                let room_id = RoomId::new(format!("room-{}", state.next_room));
                state.rooms.insert(room_id.clone(), Vec::new());
                state.deliver(from, SignalMessage::RoomCreated { room_id });
            }
            SignalMessage::Join { room_id } => {
                let Some(members) = state.rooms.get(&room_id).cloned() else {
                    state.deliver(
                        from,
                        SignalMessage::JoinReply {
                            accepted: false,
                            room_id,
                            peer_id: None,
                            message: "room not found".into(),
                        },
                    );
                    return;
                };
                state.deliver(
                    from,
                    SignalMessage::JoinReply {
                        accepted: true,
                        room_id: room_id.clone(),
                        peer_id: Some(from.clone()),
                        message: String::new(),
                    },
                );
                for member in &members {
                    state.deliver(member, SignalMessage::Invite { peer_id: from.clone() });
                }
                if let Some(members) = state.rooms.get_mut(&room_id) {
                    members.push(from.clone());
                }
            }
            SignalMessage::Offer { peer_id, sdp } => state.deliver(
                &peer_id,
                SignalMessage::Offer {
                    peer_id: from.clone(),
                    sdp,
                },
            ),
            SignalMessage::Answer { peer_id, sdp } => state.deliver(
                &peer_id,
                SignalMessage::Answer {
                    peer_id: from.clone(),
                    sdp,
                },
            ),
            SignalMessage::Candidate { peer_id, candidate } => state.deliver(
                &peer_id,
                SignalMessage::Candidate {
                    peer_id: from.clone(),
                    candidate,
                },
            ),
            SignalMessage::Leave { .. } => state.depart(from, |gone| SignalMessage::PeerLeft {
                peer_id: gone.clone(),
                message: format!("{} left the room", gone),
            }),
            other => state.deliver(
                from,
                SignalMessage::Error {
                    message: format!("unsupported message {}", other.kind()),
                },
            ),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.inner.lock().unwrap()
    }
}

type Link = (ParticipantId, ParticipantId);

/// Shared fabric the fake transports of every participant plug into.
#[derive(Clone, Default)]
pub struct FakeNetwork {
    inner: Arc<Mutex<NetState>>,
}

#[derive(Default)]
struct NetState {
    endpoints: HashMap<Link, TransportEvents>,
    tracks: Vec<(Link, String)>,
    candidates: Vec<(Link, IceCandidate)>,
    chat_sent: Vec<(Link, String)>,
    errors: Vec<String>,
    fail_offers: HashSet<Link>,
    hang_offers: HashSet<Link>,
    offer_delay: Option<Duration>,
    created: usize,
    closed: usize,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self, local: &str) -> Arc<dyn TransportFactory> {
        Arc::new(FakeTransportFactory {
            local: local.into(),
            net: self.clone(),
        })
    }

    /// Offers from `local` to `peer` fail.
    pub fn fail_offers(&self, local: &str, peer: &str) {
        self.lock().fail_offers.insert((local.into(), peer.into()));
    }

    /// Offers from `local` to `peer` never complete.
    pub fn hang_offers(&self, local: &str, peer: &str) {
        self.lock().hang_offers.insert((local.into(), peer.into()));
    }

    pub fn set_offer_delay(&self, delay: Duration) {
        self.lock().offer_delay = Some(delay);
    }

    pub fn tracks_between(&self, local: &str, peer: &str) -> usize {
        let link: Link = (local.into(), peer.into());
        self.lock().tracks.iter().filter(|(l, _)| *l == link).count()
    }

    pub fn candidates_applied(&self, local: &str, peer: &str) -> usize {
        let link: Link = (local.into(), peer.into());
        self.lock().candidates.iter().filter(|(l, _)| *l == link).count()
    }

    pub fn errors(&self) -> Vec<String> {
        self.lock().errors.clone()
    }

    pub fn created(&self) -> usize {
        self.lock().created
    }

    pub fn closed(&self) -> usize {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetState> {
        self.inner.lock().unwrap()
    }
}

struct FakeTransportFactory {
    local: ParticipantId,
    net: FakeNetwork,
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(&self, peer: &ParticipantId, events: TransportEvents) -> Result<Arc<dyn PeerTransport>> {
        let mut net = self.net.lock();
        net.created += 1;
        net.endpoints
            .insert((self.local.clone(), peer.clone()), events.clone());
        Ok(Arc::new(FakeTransport {
            local: self.local.clone(),
            peer: peer.clone(),
            net: self.net.clone(),
            events,
            state: Mutex::new(FakeState::default()),
            candidate_seq: AtomicU32::new(0),
        }))
    }
}

#[derive(Default)]
struct FakeState {
    local: Option<SdpKind>,
    remote: Option<SdpKind>,
    chat_label: Option<String>,
    connected: bool,
    closed: bool,
}

/// Scripted engine: every local description gathers one candidate, applying
/// a remote description yields two remote tracks, and the link reports
/// `Connected` once both descriptions are in place.
struct FakeTransport {
    local: ParticipantId,
    peer: ParticipantId,
    net: FakeNetwork,
    events: TransportEvents,
    state: Mutex<FakeState>,
    candidate_seq: AtomicU32,
}

impl FakeTransport {
    fn link(&self) -> Link {
        (self.local.clone(), self.peer.clone())
    }

    fn fail(&self, reason: String) -> Error {
        self.net
            .lock()
            .errors
            .push(format!("{} -> {}: {}", self.local, self.peer, reason));
        Error::Other(anyhow!(reason))
    }

    fn gather(&self) {
        let n = self.candidate_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.emit(TransportEvent::LocalCandidate(IceCandidate::new(format!(
            "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
            n,
            50000 + n
        ))));
    }

    fn maybe_connected(&self) {
        let ready = {
            let mut state = self.state.lock().unwrap();
            let ready = state.local.is_some() && state.remote.is_some() && !state.connected;
            if ready {
                state.connected = true;
            }
            ready
        };
        if ready {
            self.events
                .emit(TransportEvent::StateChanged(TransportState::Connecting));
            self.events
                .emit(TransportEvent::StateChanged(TransportState::Connected));
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<()> {
        let link = self.link();
        self.net.lock().tracks.push((link, track.id().to_owned()));
        Ok(())
    }

    async fn open_data_channel(&self, label: &str) -> Result<()> {
        self.state.lock().unwrap().chat_label = Some(label.to_owned());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let (fail, hang, delay) = {
            let net = self.net.lock();
            let link = self.link();
            (
                net.fail_offers.contains(&link),
                net.hang_offers.contains(&link),
                net.offer_delay,
            )
        };
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(self.fail("injected offer failure".into()));
        }

        let sdp = {
            let mut state = self.state.lock().unwrap();
            state.local = Some(SdpKind::Offer);
            format!(
                "v=0 fake-offer from={} chat={}",
                self.local,
                state.chat_label.clone().unwrap_or_default()
            )
        };
        self.gather();
        self.maybe_connected();
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        {
            let mut state = self.state.lock().unwrap();
            if state.remote != Some(SdpKind::Offer) {
                drop(state);
                return Err(self.fail("answer without a remote offer".into()));
            }
            state.local = Some(SdpKind::Answer);
        }
        self.gather();
        self.maybe_connected();
        Ok(SessionDescription::answer(format!("v=0 fake-answer from={}", self.local)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let chat = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            let violation = match desc.kind {
                SdpKind::Offer if state.local == Some(SdpKind::Offer) && state.remote.is_none() => {
                    Some("remote offer applied over an unanswered local offer")
                }
                SdpKind::Answer if state.local != Some(SdpKind::Offer) => Some("answer without a local offer"),
                _ => None,
            };
            if let Some(violation) = violation {
                drop(state);
                return Err(self.fail(violation.into()));
            }
            state.remote = Some(desc.kind);
            match desc.kind {
                SdpKind::Offer => desc
                    .sdp
                    .split_whitespace()
                    .find_map(|part| part.strip_prefix("chat="))
                    .filter(|label| !label.is_empty())
                    .map(str::to_owned),
                SdpKind::Answer => state.chat_label.clone(),
            }
        };

        for n in 1..=2 {
            self.events.emit(TransportEvent::RemoteTrack(RemoteTrack {
                stream_id: format!("{}-stream", self.peer),
                track_id: format!("{}-audio-{}", self.peer, n),
                kind: TrackKind::Audio,
                track: None,
            }));
        }
        if let Some(label) = chat {
            self.events.emit(TransportEvent::ChatOpened { label });
        }
        self.maybe_connected();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.state.lock().unwrap().remote.is_none() {
            return Err(self.fail(format!("candidate before remote description: {}", candidate.candidate)));
        }
        let link = self.link();
        self.net.lock().candidates.push((link, candidate));
        Ok(())
    }

    async fn send_chat(&self, text: &str) -> Result<()> {
        let remote = {
            let mut net = self.net.lock();
            net.chat_sent.push((self.link(), text.to_owned()));
            net.endpoints.get(&(self.peer.clone(), self.local.clone())).cloned()
        };
        match remote {
            Some(events) => {
                events.emit(TransportEvent::ChatMessage(text.to_owned()));
                Ok(())
            }
            None => Err(self.fail("chat peer has no transport".into())),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.closed {
            state.closed = true;
            self.net.lock().closed += 1;
        }
        Ok(())
    }
}

/// Capture that is always refused.
pub struct DenyingDevices(pub MediaError);

#[async_trait]
impl MediaDevices for DenyingDevices {
    async fn open(&self, _kind: TrackKind) -> std::result::Result<Box<dyn SampleSource>, MediaError> {
        Err(self.0.clone())
    }
}

pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.join_timeout_ms = 2_000;
    config
}

pub fn context(net: &FakeNetwork, local: &str, config: ClientConfig) -> SessionContext {
    SessionContext {
        config: Arc::new(config),
        devices: Arc::new(SyntheticDevices),
        transports: net.factory(local),
    }
}

pub async fn join(hub: &Hub, net: &FakeNetwork, id: &str, room: &str) -> (RoomSession, RoomEvents) {
    join_with(hub, net, id, room, test_config()).await
}

pub async fn join_with(
    hub: &Hub,
    net: &FakeNetwork,
    id: &str,
    room: &str,
    config: ClientConfig,
) -> (RoomSession, RoomEvents) {
    RoomSession::join(room, 1, hub.connect(id), context(net, id, config))
        .await
        .unwrap_or_else(|e| panic!("{} failed to join {}: {}", id, room, e))
}

/// Poll until `condition` holds.
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

pub fn connected_to(session: &RoomSession, peer: &str) -> bool {
    session
        .peers()
        .iter()
        .any(|p| p.id.as_str() == peer && p.state == mesh_call::NegotiationState::Connected)
}

pub fn summary_of(session: &RoomSession, peer: &str) -> Option<PeerSummary> {
    session.peers().into_iter().find(|p| p.id.as_str() == peer)
}

/// Skip events until one matches.
pub async fn expect_event<F>(events: &mut RoomEvents, what: &str, mut matches: F) -> RoomEvent
where
    F: FnMut(&RoomEvent) -> bool,
{
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Some(event)) if matches(&event) => return event,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event stream closed while waiting for {}", what),
            Err(_) => panic!("timed out waiting for {}", what),
        }
    }
}

pub fn drain_events(events: &mut RoomEvents) -> Vec<RoomEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
