use serde::{Deserialize, Serialize};
use std::fmt;

/// One-shot token issued by the signer to bind a demo-start event to its
/// matching demo-end event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce(pub [u8; 16]);

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Opaque signature bytes. The master never interprets the contents, only
/// forwards them to the peer or re-verifies them via the signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// SHA-1-sized demo hash, as sent in the SIGN_END payload.
pub type DemoHash = [u8; 20];
