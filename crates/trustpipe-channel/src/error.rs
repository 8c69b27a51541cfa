use std::time::Duration;

use crate::signature::SignatureStatus;
use crate::trust::TrustState;

/// Errors that can occur in channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] trustpipe_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] trustpipe_frame::FrameError),

    /// The OS-level check rejected the peer process.
    #[error("peer signature check failed: {0:?}")]
    SignatureCheckFailed(SignatureStatus),

    /// The OS-level check could not be performed and no fallback was possible.
    #[error("peer signature could not be determined: {0}")]
    SignatureIndeterminate(String),

    /// No challenge response arrived in time.
    #[error("trust handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The challenge response did not match the nonce.
    #[error("trust handshake verification failed")]
    HandshakeVerificationFailed,

    /// The stream was torn down by a concurrent disconnect.
    #[error("stream disposed during {0}")]
    StreamDisposedRace(&'static str),

    /// `connect()` was called while an earlier call is still establishing trust.
    #[error("trust handshake already in progress")]
    HandshakeInProgress,

    /// The channel has no live connection.
    #[error("channel is not connected")]
    NotConnected,

    /// Peer disconnected.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// A request could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Key material could not be loaded.
    #[error("key material error: {0}")]
    Key(String),

    /// A cryptographic operation failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl ChannelError {
    /// The terminal trust state this error ended a connect attempt in, if any.
    ///
    /// The live state is reset to [`TrustState::Unknown`] by the disconnect that
    /// follows a failed handshake; this keeps the outcome observable.
    pub fn trust_state(&self) -> Option<TrustState> {
        match self {
            ChannelError::SignatureCheckFailed(_) => Some(TrustState::SignatureInvalid),
            ChannelError::HandshakeTimeout(_)
            | ChannelError::HandshakeVerificationFailed
            | ChannelError::SignatureIndeterminate(_) => Some(TrustState::ChallengeFailed),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
