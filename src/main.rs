use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mesh_call::{
    create_room, ClientConfig, RoomEvent, RoomEvents, RoomId, RoomSession, RtcTransportFactory, SessionContext,
    SignalingClient, SyntheticDevices,
};

const MAX_JOIN_ATTEMPTS: u32 = 5;
const RETRY_DELAY_MS: u64 = 1000;

/// Join a full-mesh WebRTC room from the terminal.
///
/// Lines typed on stdin are sent as chat; `/mute`, `/unmute`, `/status`
/// and `/leave` control the session.
#[derive(Debug, Parser)]
#[command(name = "mesh-call", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Signaling server URL, overrides the config file
    #[arg(long, env = "MESH_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// Room to join
    #[arg(short, long, required_unless_present = "create", conflicts_with = "create")]
    room: Option<String>,

    /// Create a new room and join it
    #[arg(long)]
    create: bool,

    /// Also send video
    #[arg(long)]
    video: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mesh_call=info")))
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(url) = cli.signaling_url {
        config.signaling_url = url;
    }
    if cli.video {
        config.media.video = true;
    }
    config.validate()?;
    let config = Arc::new(config);

    let ctx = SessionContext {
        config: Arc::clone(&config),
        devices: Arc::new(SyntheticDevices),
        transports: Arc::new(RtcTransportFactory::new(&config)?),
    };

    let room_id = match cli.room {
        Some(room) => RoomId::from(room),
        None => {
            let mut signaling = SignalingClient::connect(&config.signaling_url).await?;
            let room_id = create_room(&mut signaling, config.join_timeout()).await?;
            info!(room = %room_id, "share this room id to invite others");
            room_id
        }
    };

    let (session, events) = join_with_retry(&room_id, &ctx).await?;
    run(session, events).await
}

async fn join_with_retry(room_id: &RoomId, ctx: &SessionContext) -> mesh_call::Result<(RoomSession, RoomEvents)> {
    let mut attempt = 1;
    loop {
        let result = match SignalingClient::connect(&ctx.config.signaling_url).await {
            Ok(signaling) => RoomSession::join(room_id.clone(), attempt, signaling, ctx.clone()).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(joined) => return Ok(joined),
            Err(e) if e.is_retryable() && attempt < MAX_JOIN_ATTEMPTS => {
                warn!(attempt, error = %e, "join failed, retrying");
                attempt += 1;
                sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run(mut session: RoomSession, mut events: RoomEvents) -> anyhow::Result<()> {
    info!(
        room = %session.room_id(),
        peer = %session.local_id(),
        "in room; type to chat, /mute, /unmute, /status, /leave"
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            event = events.recv() => match event {
                Some(event) => log_event(event),
                None => break,
            },
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_line(&mut session, line.trim()).await? {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    session.leave().await;
    Ok(())
}

/// Returns false when the user asked to leave.
async fn handle_line(session: &mut RoomSession, line: &str) -> anyhow::Result<bool> {
    match line {
        "" => {}
        "/leave" => return Ok(false),
        "/mute" => session.set_muted(true),
        "/unmute" => session.set_muted(false),
        "/status" => {
            let state = session.invite_state();
            let peers = serde_json::to_string(&session.peers())?;
            info!(
                muted = state.muted,
                participants = state.participant_count,
                %peers,
                "status"
            );
        }
        text => {
            let delivered = session.send_chat(text).await?;
            if delivered == 0 {
                warn!("no open chat channel, message not sent");
            }
        }
    }
    Ok(true)
}

fn log_event(event: RoomEvent) {
    match event {
        RoomEvent::LocalStreamReady(stream) => {
            info!(stream = %stream.stream_id, tracks = stream.tracks.len(), "local media ready")
        }
        RoomEvent::RemoteTrackAvailable { peer, stream } => {
            info!(%peer, stream = %stream.stream_id(), tracks = ?stream.track_ids(), "receiving media")
        }
        RoomEvent::PeerRemoved { peer } => info!(%peer, "participant left"),
        RoomEvent::ChatReady { peer } => info!(%peer, "chat ready"),
        RoomEvent::ChatClosed { peer } => info!(%peer, "chat closed"),
        RoomEvent::ChatMessage { peer, text } => info!(%peer, "{}", text),
        RoomEvent::Notice(message) => info!("server: {}", message),
        RoomEvent::SignalingLost => warn!("signaling connection lost; nobody new can join"),
    }
}
