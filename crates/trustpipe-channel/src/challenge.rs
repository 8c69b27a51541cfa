//! Encrypted-nonce challenge primitives.
//!
//! The client encrypts a fresh nonce with the service public key. Only the
//! holder of the private key can recover it and return a signature over it,
//! which the client checks with the same public key.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::distributions::Uniform;
use rand::rngs::OsRng;
use rand::Rng;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{ChannelError, Result};
use crate::keys::KeySource;

/// Single-use random value proving the responder holds the private key.
pub struct Nonce(Zeroizing<String>);

impl Nonce {
    /// Lowercase ASCII letters drawn from the OS random source.
    pub fn generate(len: usize) -> Self {
        let letters = Uniform::new_inclusive(b'a', b'z');
        let value: String = OsRng
            .sample_iter(letters)
            .take(len)
            .map(char::from)
            .collect();
        Self(Zeroizing::new(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Nonce(<redacted>)")
    }
}

/// Encrypt `nonce` for the service and base64 it for the request argument.
pub fn encrypt_nonce(public: &RsaPublicKey, nonce: &Nonce) -> Result<String> {
    let ciphertext = public
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, nonce.as_bytes())
        .map_err(|err| ChannelError::Crypto(format!("nonce encryption failed: {err}")))?;
    Ok(STANDARD.encode(ciphertext))
}

/// Check a challenge response against the nonce that was sent.
pub fn verify_response(public: &RsaPublicKey, nonce: &Nonce, response: &[u8]) -> bool {
    let Ok(signature) = Signature::try_from(response) else {
        debug!(size = response.len(), "challenge response is not a signature");
        return false;
    };
    VerifyingKey::<Sha256>::new(public.clone())
        .verify(nonce.as_bytes(), &signature)
        .is_ok()
}

/// Answer a challenge on the service side.
///
/// Decrypts the base64 nonce with the private key and returns a signature
/// over it, sent back as the raw response frame.
pub fn respond_to_challenge(keys: &dyn KeySource, encrypted_b64: &str) -> Result<Vec<u8>> {
    let pair = keys.key_pair()?;
    let private = pair.private()?;

    let ciphertext = STANDARD
        .decode(encrypted_b64.trim())
        .map_err(|err| ChannelError::Crypto(format!("challenge is not base64: {err}")))?;
    let nonce = Zeroizing::new(
        private
            .decrypt(Pkcs1v15Encrypt, &ciphertext)
            .map_err(|err| ChannelError::Crypto(format!("challenge decryption failed: {err}")))?,
    );

    let signature = SigningKey::<Sha256>::new(private.clone()).sign(&nonce);
    Ok(signature.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_keys;

    #[test]
    fn nonce_is_lowercase_of_requested_length() {
        let nonce = Nonce::generate(5);
        assert_eq!(nonce.as_str().len(), 5);
        assert!(nonce.as_str().bytes().all(|b| b.is_ascii_lowercase()));
        assert_eq!(Nonce::generate(0).as_str(), "");
    }

    #[test]
    fn nonce_debug_is_redacted() {
        let nonce = Nonce::generate(8);
        assert_eq!(format!("{nonce:?}"), "Nonce(<redacted>)");
    }

    #[test]
    fn service_response_verifies() {
        let keys = test_keys::shared();
        let public = keys.key_pair().unwrap().public;
        let nonce = Nonce::generate(5);

        let encrypted = encrypt_nonce(&public, &nonce).unwrap();
        let response = respond_to_challenge(&keys, &encrypted).unwrap();
        assert!(verify_response(&public, &nonce, &response));
    }

    #[test]
    fn response_for_other_nonce_rejected() {
        let keys = test_keys::shared();
        let public = keys.key_pair().unwrap().public;

        let encrypted = encrypt_nonce(&public, &Nonce::generate(5)).unwrap();
        let response = respond_to_challenge(&keys, &encrypted).unwrap();
        let other = Nonce::generate(12);
        assert!(!verify_response(&public, &other, &response));
    }

    #[test]
    fn response_from_other_key_rejected() {
        let keys = test_keys::shared();
        let impostor = test_keys::other();
        let public = keys.key_pair().unwrap().public;
        let nonce = Nonce::generate(5);

        // The impostor cannot decrypt a nonce meant for the real key.
        let encrypted = encrypt_nonce(&public, &nonce).unwrap();
        assert!(respond_to_challenge(&impostor, &encrypted).is_err());

        let impostor_public = impostor.key_pair().unwrap().public;
        let encrypted = encrypt_nonce(&impostor_public, &nonce).unwrap();
        let response = respond_to_challenge(&impostor, &encrypted).unwrap();
        assert!(!verify_response(&public, &nonce, &response));
    }

    #[test]
    fn garbage_inputs_rejected() {
        let keys = test_keys::shared();
        let public = keys.key_pair().unwrap().public;
        assert!(!verify_response(&public, &Nonce::generate(5), b""));
        assert!(matches!(
            respond_to_challenge(&keys, "***"),
            Err(ChannelError::Crypto(_))
        ));
        assert!(matches!(
            respond_to_challenge(&keys.public_only(), "AAAA"),
            Err(ChannelError::Key(_))
        ));
    }
}
