use std::fmt;
use std::path::Path;

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use zeroize::Zeroizing;

use crate::error::{ChannelError, Result};

/// Default modulus size for generated keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Asymmetric key material for the fallback challenge.
///
/// Clients only need the public half; the service also holds the private half.
#[derive(Clone)]
pub struct KeyPair {
    pub public: RsaPublicKey,
    pub private: Option<RsaPrivateKey>,
}

impl KeyPair {
    /// The private half, or an error for public-only material.
    pub fn private(&self) -> Result<&RsaPrivateKey> {
        self.private
            .as_ref()
            .ok_or_else(|| ChannelError::Key("private key not available".to_string()))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &"<rsa public key>")
            .field(
                "private",
                &self.private.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Supplies the current key pair.
///
/// Provisioning and rotation live behind this trait; the handshake asks for
/// keys on every attempt and never caches them.
pub trait KeySource: Send + Sync {
    fn key_pair(&self) -> Result<KeyPair>;
}

/// Key material held in memory.
#[derive(Debug, Clone)]
pub struct StaticKeySource {
    pair: KeyPair,
}

impl StaticKeySource {
    pub fn new(pair: KeyPair) -> Self {
        Self { pair }
    }

    /// Generate a fresh key pair.
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|err| ChannelError::Key(format!("key generation failed: {err}")))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self::new(KeyPair {
            public,
            private: Some(private),
        }))
    }

    /// Public-only material from an SPKI PEM document.
    pub fn from_public_pem(pem: &str) -> Result<Self> {
        let public = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|err| ChannelError::Key(format!("invalid public key: {err}")))?;
        Ok(Self::new(KeyPair {
            public,
            private: None,
        }))
    }

    /// Full material from a PKCS#8 PEM private key.
    pub fn from_private_pem(pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|err| ChannelError::Key(format!("invalid private key: {err}")))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self::new(KeyPair {
            public,
            private: Some(private),
        }))
    }

    pub fn from_public_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_public_pem(&read_pem(path.as_ref())?)
    }

    pub fn from_private_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_private_pem(&read_pem(path.as_ref())?)
    }

    /// The public half as an SPKI PEM document.
    pub fn public_pem(&self) -> Result<String> {
        self.pair
            .public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| ChannelError::Key(format!("public key encoding failed: {err}")))
    }

    /// The private half as a PKCS#8 PEM document.
    pub fn private_pem(&self) -> Result<Zeroizing<String>> {
        self.pair
            .private()?
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| ChannelError::Key(format!("private key encoding failed: {err}")))
    }

    /// A copy of this source without the private half.
    pub fn public_only(&self) -> Self {
        Self::new(KeyPair {
            public: self.pair.public.clone(),
            private: None,
        })
    }
}

impl KeySource for StaticKeySource {
    fn key_pair(&self) -> Result<KeyPair> {
        Ok(self.pair.clone())
    }
}

fn read_pem(path: &Path) -> Result<Zeroizing<String>> {
    std::fs::read_to_string(path)
        .map(Zeroizing::new)
        .map_err(|err| ChannelError::Key(format!("failed reading {}: {err}", path.display())))
}
