use std::fmt;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

use crate::media::MediaError;
use crate::signaling::ParticipantId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("media access denied: {0}")]
    MediaAccessDenied(MediaDenial),

    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("negotiation with {peer} failed: {reason}")]
    NegotiationFailure { peer: ParticipantId, reason: String },

    #[error("protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    #[error("room {room} rejected: {message}")]
    UnknownRoom { room: String, message: String },

    #[error("room is full ({0} peers)")]
    RoomFull(usize),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn anomaly(reason: impl Into<String>) -> Self {
        Error::ProtocolAnomaly(reason.into())
    }

    /// Whether the caller may try again (only meaningful for room-scoped failures).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::MediaAccessDenied(denial) => denial.retry.is_retryable(),
            Error::SignalingUnavailable(_) => true,
            _ => false,
        }
    }
}

/// Whether a failed media grant may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAdvice {
    Retry { remaining: u32 },
    /// Attempts exhausted; the user has to re-enable access outside the app.
    Terminal,
}

impl RetryAdvice {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryAdvice::Retry { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDenial {
    pub cause: MediaError,
    /// 1-based attempt number this denial belongs to.
    pub attempt: u32,
    pub retry: RetryAdvice,
}

impl MediaDenial {
    pub fn classify(cause: MediaError, attempt: u32, max_attempts: u32) -> Self {
        let attempt = attempt.max(1);
        let retry = if attempt < max_attempts {
            RetryAdvice::Retry {
                remaining: max_attempts - attempt,
            }
        } else {
            RetryAdvice::Terminal
        };
        Self {
            cause,
            attempt,
            retry,
        }
    }
}

impl fmt::Display for MediaDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.retry {
            RetryAdvice::Retry { remaining } => write!(
                f,
                "{} (attempt {}, {} left)",
                self.cause, self.attempt, remaining
            ),
            RetryAdvice::Terminal => write!(f, "{} (attempt {}, giving up)", self.cause, self.attempt),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
