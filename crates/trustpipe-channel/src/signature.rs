//! OS-level peer checks.
//!
//! The first line of trust: ask the platform whether the process at the other
//! end of the pipe belongs to the expected authority. The outcome decides
//! whether the channel is trusted outright, rejected, or must fall back to the
//! cryptographic challenge.

use trustpipe_transport::PeerIdentity;

/// Outcome of an OS-level peer check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    /// The peer belongs to the expected authority.
    Success,
    /// The check could not be performed for lack of privilege.
    AccessDenied,
    /// The peer is definitely not the expected authority.
    SignFailed,
    /// The check produced no usable answer.
    Unknown,
}

/// Checks whether a connected peer process is vouched for by the platform.
pub trait SignatureVerifier: Send + Sync {
    /// Classify the peer. `peer` is `None` when the OS did not report an identity.
    fn verify_peer(&self, peer: Option<&PeerIdentity>) -> SignatureStatus;
}

/// Always reports the same status.
///
/// Useful when the deployment has no meaningful OS check, or to force the
/// challenge fallback with [`SignatureStatus::AccessDenied`].
#[derive(Debug, Clone, Copy)]
pub struct FixedStatus(pub SignatureStatus);

impl SignatureVerifier for FixedStatus {
    fn verify_peer(&self, _peer: Option<&PeerIdentity>) -> SignatureStatus {
        self.0
    }
}

/// Trusts peers running under an expected user id.
///
/// A peer whose credentials cannot be read is reported as `AccessDenied`,
/// which routes the connection to the challenge fallback.
#[derive(Debug, Clone, Copy)]
pub struct PeerUidVerifier {
    expected_uid: u32,
}

impl PeerUidVerifier {
    pub fn new(expected_uid: u32) -> Self {
        Self { expected_uid }
    }

    /// Expect the peer to run as the superuser (uid 0).
    pub fn root() -> Self {
        Self::new(0)
    }

    /// Expect the peer to run as the current effective user.
    #[cfg(unix)]
    pub fn current_user() -> Self {
        // SAFETY: geteuid has no preconditions and cannot fail.
        Self::new(unsafe { libc::geteuid() })
    }

    pub fn expected_uid(&self) -> u32 {
        self.expected_uid
    }
}

impl SignatureVerifier for PeerUidVerifier {
    fn verify_peer(&self, peer: Option<&PeerIdentity>) -> SignatureStatus {
        match peer.and_then(|identity| identity.uid) {
            Some(uid) if uid == self.expected_uid => SignatureStatus::Success,
            Some(_) => SignatureStatus::SignFailed,
            None => SignatureStatus::AccessDenied,
        }
    }
}

/// The verifier a channel uses when none is configured.
pub fn default_verifier() -> PeerUidVerifier {
    PeerUidVerifier::root()
}
