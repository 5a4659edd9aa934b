//! Local capture: device seam, outbound tracks and the per-session media source.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::MediaConfig;
use crate::error::Result;

/// One 20 ms Opus frame of silence (TOC 0xf8, comfort-noise payload).
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const OPUS_FRAME: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Encoded samples coming out of a capture device.
#[async_trait]
pub trait SampleSource: Send {
    fn codec(&self) -> RTCRtpCodecCapability;

    /// Next encoded sample; `None` when the device stops producing.
    async fn next_sample(&mut self) -> Option<Sample>;
}

/// Access to capture devices. Implemented by the embedding application.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(&self, kind: TrackKind) -> std::result::Result<Box<dyn SampleSource>, MediaError>;
}

/// Outbound track shared read-only by every peer connection.
pub struct LocalTrack {
    kind: TrackKind,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    forwarded: AtomicU64,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, codec: RTCRtpCodecCapability, stream_id: &str) -> Self {
        let id = format!("{}-{:08x}", kind, rand::random::<u32>());
        Self {
            kind,
            rtc: Arc::new(TrackLocalStaticSample::new(codec, id, stream_id.to_owned())),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            forwarded: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        self.rtc.id()
    }

    pub fn stream_id(&self) -> &str {
        self.rtc.stream_id()
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Flip the enabled flag in place. The track stays attached everywhere.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Samples that got past the enabled/stopped gate.
    pub fn forwarded_samples(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.rtc) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Forward one sample to every bound connection. Disabled or stopped
    /// tracks swallow the sample.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(());
        }
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.rtc.write_sample(sample).await?;
        Ok(())
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// The local capture as handed to the renderer.
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub stream_id: String,
    pub tracks: Vec<Arc<LocalTrack>>,
}

/// Owns the single local capture of a room session.
pub struct LocalMediaSource {
    stream: LocalStream,
    pumps: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl LocalMediaSource {
    /// Open every requested device and start pumping its samples into a track.
    pub async fn acquire(
        devices: &dyn MediaDevices,
        config: &MediaConfig,
    ) -> std::result::Result<Self, MediaError> {
        let kinds = config.requested_kinds();
        if kinds.is_empty() {
            return Err(MediaError::DeviceUnavailable("no audio or video requested".into()));
        }

        let stream_id = format!("mesh-{:08x}", rand::random::<u32>());
        // Dropped on early return, which stops whatever was already opened.
        let mut source = Self {
            stream: LocalStream {
                stream_id: stream_id.clone(),
                tracks: Vec::with_capacity(kinds.len()),
            },
            pumps: Vec::with_capacity(kinds.len()),
            stopped: false,
        };

        for kind in kinds {
            let device = devices.open(kind).await?;
            let track = Arc::new(LocalTrack::new(kind, device.codec(), &stream_id));
            info!(track = track.id(), %kind, "local capture started");
            source.pumps.push(tokio::spawn(pump(device, Arc::clone(&track))));
            source.stream.tracks.push(track);
        }

        Ok(source)
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.stream.tracks
    }

    pub fn stream(&self) -> LocalStream {
        self.stream.clone()
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in self.tracks().iter().filter(|t| t.kind() == TrackKind::Audio) {
            track.set_enabled(enabled);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Stop every track. Safe to call more than once.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        for track in &self.stream.tracks {
            track.stop();
        }
        debug!(stream = %self.stream.stream_id, "local capture stopped");
    }
}

impl Drop for LocalMediaSource {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn pump(mut device: Box<dyn SampleSource>, track: Arc<LocalTrack>) {
    while let Some(sample) = device.next_sample().await {
        if track.is_stopped() {
            break;
        }
        if let Err(e) = track.write_sample(&sample).await {
            warn!(track = track.id(), error = %e, "failed to write local sample");
        }
    }
    debug!(track = track.id(), forwarded = track.forwarded_samples(), "capture device finished");
}

/// Device-less capture producing Opus silence. Audio only.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticDevices;

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open(&self, kind: TrackKind) -> std::result::Result<Box<dyn SampleSource>, MediaError> {
        match kind {
            TrackKind::Audio => Ok(Box::new(SilenceSource::new())),
            TrackKind::Video => Err(MediaError::DeviceUnavailable(
                "synthetic devices provide audio only".into(),
            )),
        }
    }
}

struct SilenceSource {
    ticker: Interval,
}

impl SilenceSource {
    fn new() -> Self {
        let mut ticker = interval(OPUS_FRAME);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { ticker }
    }
}

#[async_trait]
impl SampleSource for SilenceSource {
    fn codec(&self) -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        }
    }

    async fn next_sample(&mut self) -> Option<Sample> {
        self.ticker.tick().await;
        Some(Sample {
            data: Bytes::from_static(&OPUS_SILENCE),
            duration: OPUS_FRAME,
            ..Default::default()
        })
    }
}
