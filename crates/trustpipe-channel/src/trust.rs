//! Trust state machine and the handshake that drives it.
//!
//! Every connect attempt starts at [`TrustState::Unknown`]. The OS-level peer
//! check either settles trust immediately or, when it cannot be performed,
//! hands over to an encrypted-nonce challenge answered by the service.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rsa::RsaPublicKey;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::challenge::{encrypt_nonce, verify_response, Nonce};
use crate::error::{ChannelError, Result};
use crate::keys::KeySource;
use crate::message::ClientRequest;
use crate::signature::{default_verifier, SignatureStatus, SignatureVerifier};
use crate::transport::Transport;

/// Default time to wait for a challenge response.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default nonce length, kept for compatibility with deployed services.
pub const NONCE_LEN: usize = 5;

/// Where a connection stands in establishing trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrustState {
    Unknown,
    SignatureValid,
    SignatureInvalid,
    SignatureIndeterminate,
    ChallengeSent,
    ChallengeVerified,
    ChallengeFailed,
}

impl TrustState {
    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrustState::SignatureValid
                | TrustState::SignatureInvalid
                | TrustState::ChallengeVerified
                | TrustState::ChallengeFailed
        )
    }

    /// Terminal and positive: messages may flow.
    pub fn is_trusted(self) -> bool {
        matches!(self, TrustState::SignatureValid | TrustState::ChallengeVerified)
    }

    /// Whether `next` is a legal forward step from `self`.
    pub fn can_advance_to(self, next: TrustState) -> bool {
        use TrustState::*;
        matches!(
            (self, next),
            (Unknown, SignatureValid | SignatureInvalid | SignatureIndeterminate)
                | (SignatureIndeterminate, ChallengeSent | ChallengeFailed)
                | (ChallengeSent, ChallengeVerified | ChallengeFailed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrustState::Unknown => "unknown",
            TrustState::SignatureValid => "signature-valid",
            TrustState::SignatureInvalid => "signature-invalid",
            TrustState::SignatureIndeterminate => "signature-indeterminate",
            TrustState::ChallengeSent => "challenge-sent",
            TrustState::ChallengeVerified => "challenge-verified",
            TrustState::ChallengeFailed => "challenge-failed",
        }
    }
}

impl std::fmt::Display for TrustState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake tuning.
#[derive(Debug, Clone)]
pub struct TrustConfig {
    /// How long to wait for the service to answer a challenge.
    pub handshake_timeout: Duration,
    /// Length of the generated nonce.
    pub nonce_len: usize,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            nonce_len: NONCE_LEN,
        }
    }
}

/// A challenge waiting for its response frame.
pub(crate) struct PendingChallenge {
    nonce: Nonce,
    public: RsaPublicKey,
    done: oneshot::Sender<bool>,
}

/// Per-connection trust bookkeeping shared with the read loop.
pub(crate) struct TrustSession {
    state: TrustState,
    pending: Option<PendingChallenge>,
    first_message: bool,
}

impl Default for TrustSession {
    fn default() -> Self {
        Self {
            state: TrustState::Unknown,
            pending: None,
            first_message: true,
        }
    }
}

impl TrustSession {
    pub(crate) fn state(&self) -> TrustState {
        self.state
    }

    /// Move to `next`; backward or sideways steps are refused.
    pub(crate) fn advance(&mut self, next: TrustState) -> bool {
        if self.state.can_advance_to(next) {
            debug!(from = %self.state, to = %next, "trust state transition");
            self.state = next;
            true
        } else {
            warn!(from = %self.state, to = %next, "rejected trust state transition");
            false
        }
    }

    /// Trust the connection without a check (service side).
    pub(crate) fn assume_valid(&mut self) {
        self.advance(TrustState::SignatureValid);
    }

    /// Back to a fresh-instance state. Dropping a pending challenge releases
    /// its waiter.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    /// Mark an outstanding challenge as failed and release its waiter.
    fn fail_challenge(&mut self) {
        self.pending = None;
        self.advance(TrustState::ChallengeFailed);
    }

    /// Offer an inbound frame to the handshake.
    ///
    /// Returns `None` when the frame was consumed as a challenge response or
    /// dropped, and the payload back when it may be delivered.
    pub(crate) fn admit(&mut self, payload: bytes::Bytes) -> Option<bytes::Bytes> {
        if self.state == TrustState::ChallengeSent && self.first_message {
            self.first_message = false;
            if let Some(pending) = self.pending.take() {
                let verified = verify_response(&pending.public, &pending.nonce, &payload);
                if verified {
                    info!("challenge response verified");
                    self.advance(TrustState::ChallengeVerified);
                } else {
                    warn!(size = payload.len(), "challenge response did not verify");
                    self.advance(TrustState::ChallengeFailed);
                }
                let _ = pending.done.send(verified);
                return None;
            }
        }

        if !self.state.is_trusted() {
            warn!(state = %self.state, size = payload.len(), "dropping frame received before trust");
            return None;
        }
        self.first_message = false;
        Some(payload)
    }
}

pub(crate) type SharedSession = Arc<Mutex<TrustSession>>;

pub(crate) fn lock(session: &SharedSession) -> MutexGuard<'_, TrustSession> {
    session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Establishes trust on a freshly opened connection.
#[derive(Clone)]
pub struct TrustVerifier {
    verifier: Arc<dyn SignatureVerifier>,
    keys: Option<Arc<dyn KeySource>>,
    config: TrustConfig,
}

impl Default for TrustVerifier {
    fn default() -> Self {
        Self::new(Arc::new(default_verifier()))
    }
}

impl std::fmt::Debug for TrustVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustVerifier")
            .field("has_keys", &self.keys.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl TrustVerifier {
    pub fn new(verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self {
            verifier,
            keys: None,
            config: TrustConfig::default(),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Key material for the challenge fallback. Without it an indeterminate
    /// signature check fails the connection.
    pub fn with_key_source(mut self, keys: Arc<dyn KeySource>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_config(mut self, config: TrustConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    /// Run the handshake to a terminal state.
    ///
    /// On error the session is left in its failed terminal state; the caller
    /// owns the disconnect.
    pub(crate) async fn establish(
        &self,
        session: &SharedSession,
        transport: &Transport,
    ) -> Result<TrustState> {
        let peer = transport.peer_identity();
        let status = self.verifier.verify_peer(peer.as_ref());
        debug!(?peer, ?status, "peer signature check");

        match status {
            SignatureStatus::Success => {
                lock(session).advance(TrustState::SignatureValid);
                Ok(TrustState::SignatureValid)
            }
            SignatureStatus::SignFailed | SignatureStatus::Unknown => {
                lock(session).advance(TrustState::SignatureInvalid);
                Err(ChannelError::SignatureCheckFailed(status))
            }
            SignatureStatus::AccessDenied => {
                lock(session).advance(TrustState::SignatureIndeterminate);
                self.challenge(session, transport).await
            }
        }
    }

    async fn challenge(&self, session: &SharedSession, transport: &Transport) -> Result<TrustState> {
        let (request, done) = match self.prepare_challenge(session) {
            Ok(prepared) => prepared,
            Err(err) => {
                lock(session).fail_challenge();
                return Err(err);
            }
        };

        if let Err(err) = transport.send(request.into()).await {
            lock(session).fail_challenge();
            return Err(err);
        }
        info!(timeout = ?self.config.handshake_timeout, "trust challenge sent");

        match tokio::time::timeout(self.config.handshake_timeout, done).await {
            Ok(Ok(true)) => Ok(TrustState::ChallengeVerified),
            Ok(Ok(false)) => Err(ChannelError::HandshakeVerificationFailed),
            Ok(Err(_)) => Err(ChannelError::Disconnected(
                "connection closed during trust handshake".to_string(),
            )),
            Err(_) => {
                lock(session).fail_challenge();
                warn!(timeout = ?self.config.handshake_timeout, "trust challenge timed out");
                Err(ChannelError::HandshakeTimeout(self.config.handshake_timeout))
            }
        }
    }

    /// Build the challenge request and arm the session for its response.
    ///
    /// The session is armed before the request is written, so a response
    /// racing the send is still matched.
    fn prepare_challenge(
        &self,
        session: &SharedSession,
    ) -> Result<(Vec<u8>, oneshot::Receiver<bool>)> {
        let keys = self.keys.as_ref().ok_or_else(|| {
            ChannelError::SignatureIndeterminate("no key source configured for challenge".to_string())
        })?;
        let pair = keys.key_pair()?;
        let nonce = Nonce::generate(self.config.nonce_len);
        let encrypted = encrypt_nonce(&pair.public, &nonce)?;
        let payload = ClientRequest::challenge(encrypted).to_vec()?;

        let (done, rx) = oneshot::channel();
        let mut guard = lock(session);
        guard.pending = Some(PendingChallenge {
            nonce,
            public: pair.public,
            done,
        });
        guard.advance(TrustState::ChallengeSent);
        Ok((payload, rx))
    }
}
