//! Signer adapter for the signed-demo issuance protocol (spec.md §6). The
//! spec leaves the signer's internals unspecified beyond its two
//! operations; `DemoSigner` is that contract, and `Ed25519DemoSigner` is a
//! concrete in-process implementation grounded on the `ed25519-dalek` usage
//! already present in the teacher's control-plane and stream crates.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use ed25519_dalek::{Signature as DalekSignature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::RngCore;

use crate::error::Error;
use crate::types::{DemoHash, Nonce, Signature};

const SIGNATURE_LEN: usize = 64;

/// Separates a start-signature's signing domain from an end-signature's, so
/// a captured SIGN_START response can never be replayed as a SIGN_END one.
const END_DOMAIN_PREFIX: &[u8] = b"masterd-demo-end:v1:";

#[async_trait]
pub trait DemoSigner: Send + Sync {
    /// Issue a fresh nonce and a signature over it, for SIGN_START.
    async fn sign_start(&self) -> (Nonce, Signature);

    /// Verify the signature embedded in `start_message` (the nonce ‖
    /// signature pair returned by `sign_start`, treated as opaque by the
    /// caller) and, on success, return a signature binding it to `hash`.
    /// Returns `None` on any verification failure, including nonce replay.
    async fn sign_end(&self, start_message: &[u8], hash: &DemoHash) -> Option<Signature>;

    fn hex(&self, bytes: &[u8]) -> String {
        hex::encode(bytes)
    }

    /// Escape hatch for callers that need to reach an implementation's own
    /// maintenance hooks (e.g. `Ed25519DemoSigner::gc_nonces`) without
    /// widening this trait for every backend.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// In-process signer backed by a single ed25519 keypair. Remembers issued
/// nonces so a SIGN_END cannot be replayed once consumed (spec.md §6).
pub struct Ed25519DemoSigner {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    issued_nonces: Mutex<HashSet<[u8; 16]>>,
}

impl Ed25519DemoSigner {
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self, Error> {
        let bytes =
            hex::decode(seed_hex).map_err(|e| Error::config(format!("invalid signing key hex: {e}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::config("signing key must decode to exactly 32 bytes"))?;
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        Ok(Self {
            signing_key,
            verifying_key,
            issued_nonces: Mutex::new(HashSet::new()),
        })
    }

    /// Drop all outstanding nonces. Called off the aging-pass tick so a
    /// client that never follows SIGN_START with SIGN_END doesn't leak
    /// memory, at the cost of also invalidating any SIGN_START issued
    /// before the last sweep — acceptable since the demo flow is expected
    /// to complete within a session, not across ticks of neglect.
    pub fn gc_nonces(&self) {
        let mut nonces = self.issued_nonces.lock().unwrap();
        let dropped = nonces.len();
        nonces.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "swept outstanding SIGN_START nonces");
        }
    }
}

#[async_trait]
impl DemoSigner for Ed25519DemoSigner {
    async fn sign_start(&self) -> (Nonce, Signature) {
        let mut nonce_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        self.issued_nonces.lock().unwrap().insert(nonce_bytes);
        let sig = self.signing_key.sign(&nonce_bytes);
        (Nonce(nonce_bytes), Signature(sig.to_bytes().to_vec()))
    }

    async fn sign_end(&self, start_message: &[u8], hash: &DemoHash) -> Option<Signature> {
        if start_message.len() != 16 + SIGNATURE_LEN {
            return None;
        }
        let (nonce_bytes, sig_bytes) = start_message.split_at(16);
        let mut nonce = [0u8; 16];
        nonce.copy_from_slice(nonce_bytes);

        // Consume the nonce up front: a failed verification below must not
        // leave it available for a second attempt.
        if !self.issued_nonces.lock().unwrap().remove(&nonce) {
            tracing::debug!(nonce = %self.hex(&nonce), "SIGN_END with unknown or replayed nonce");
            return None;
        }

        let Ok(sig) = DalekSignature::try_from(sig_bytes) else {
            tracing::warn!(nonce = %self.hex(&nonce), "SIGN_END start message has a malformed signature");
            return None;
        };
        if self.verifying_key.verify(&nonce, &sig).is_err() {
            tracing::warn!(nonce = %self.hex(&nonce), "SIGN_END start message failed signature verification");
            return None;
        }

        let mut message = Vec::with_capacity(END_DOMAIN_PREFIX.len() + start_message.len() + hash.len());
        message.extend_from_slice(END_DOMAIN_PREFIX);
        message.extend_from_slice(start_message);
        message.extend_from_slice(hash);
        let end_sig = self.signing_key.sign(&message);
        Some(Signature(end_sig.to_bytes().to_vec()))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> Ed25519DemoSigner {
        Ed25519DemoSigner::from_seed_hex(&"11".repeat(32)).unwrap()
    }

    #[tokio::test]
    async fn sign_end_accepts_a_valid_start_message_once() {
        let signer = signer();
        let (nonce, sig) = signer.sign_start().await;
        let mut start_message = nonce.0.to_vec();
        start_message.extend_from_slice(sig.as_bytes());
        let hash = [7u8; 20];

        let end_sig = signer.sign_end(&start_message, &hash).await;
        assert!(end_sig.is_some());

        // Replaying the same start message must fail once the nonce is consumed.
        let replay = signer.sign_end(&start_message, &hash).await;
        assert!(replay.is_none());
    }

    #[tokio::test]
    async fn sign_end_rejects_tampered_signature() {
        let signer = signer();
        let (nonce, _sig) = signer.sign_start().await;
        let mut start_message = nonce.0.to_vec();
        start_message.extend_from_slice(&[0u8; 64]);
        let hash = [7u8; 20];
        assert!(signer.sign_end(&start_message, &hash).await.is_none());
    }
}
