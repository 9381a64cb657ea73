//! Ed25519 participant identity
//!
//! Create and join requests can be signed so the discovery service can bind
//! a session to a key. Signed payloads:
//!
//! ```text
//! create: "create" || timestamp(u64 BE) || capabilities(u8) || max_participants(u8)
//! join:   "join"   || timestamp(u64 BE) || session_string
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, KeyPair, UnparsedPublicKey};

use crate::error::{Error, Result};

/// Accepted clock skew for signed requests
pub const TIMESTAMP_WINDOW_SECS: u64 = 300;

pub struct Identity {
    key_pair: Ed25519KeyPair,
    pkcs8: Vec<u8>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}

impl Identity {
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let document = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| Error::Crypto("Ed25519 key generation failed".to_string()))?;
        Self::from_pkcs8(document.as_ref())
    }

    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Self> {
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| Error::Crypto(format!("invalid Ed25519 key: {}", e)))?;
        Ok(Self {
            key_pair,
            pkcs8: pkcs8.to_vec(),
        })
    }

    /// PKCS#8 document for persisting the key
    pub fn pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }

    pub fn public_key(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.key_pair.public_key().as_ref());
        out
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        let mut out = [0u8; 64];
        out.copy_from_slice(self.key_pair.sign(msg).as_ref());
        out
    }
}

pub fn verify(public_key: &[u8; 32], msg: &[u8], sig: &[u8]) -> bool {
    UnparsedPublicKey::new(&signature::ED25519, public_key)
        .verify(msg, sig)
        .is_ok()
}

pub fn create_signing_payload(timestamp: u64, capabilities: u8, max_participants: u8) -> Vec<u8> {
    let mut payload = Vec::with_capacity(6 + 8 + 2);
    payload.extend_from_slice(b"create");
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload.push(capabilities);
    payload.push(max_participants);
    payload
}

pub fn join_signing_payload(timestamp: u64, session_string: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + 8 + session_string.len());
    payload.extend_from_slice(b"join");
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload.extend_from_slice(session_string.as_bytes());
    payload
}

/// Seconds since the Unix epoch
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn timestamp_within_window(timestamp: u64, now: u64) -> bool {
    timestamp.abs_diff(now) <= TIMESTAMP_WINDOW_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let id = Identity::generate().unwrap();
        let payload = create_signing_payload(1_700_000_000, 3, 8);
        let sig = id.sign(&payload);

        assert!(verify(&id.public_key(), &payload, &sig));

        let other = create_signing_payload(1_700_000_000, 3, 9);
        assert!(!verify(&id.public_key(), &other, &sig));
    }

    #[test]
    fn test_reload_from_pkcs8() {
        let id = Identity::generate().unwrap();
        let reloaded = Identity::from_pkcs8(id.pkcs8()).unwrap();
        assert_eq!(id.public_key(), reloaded.public_key());
        assert!(Identity::from_pkcs8(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_payload_layout() {
        let p = create_signing_payload(1, 0x03, 4);
        assert_eq!(&p[..6], b"create");
        assert_eq!(&p[6..14], &1u64.to_be_bytes());
        assert_eq!(&p[14..], &[0x03, 4]);

        let j = join_signing_payload(2, "calm-river-stone");
        assert_eq!(&j[..4], b"join");
        assert_eq!(&j[12..], b"calm-river-stone");
    }

    #[test]
    fn test_timestamp_window() {
        let now = 1_000_000;
        assert!(timestamp_within_window(now, now));
        assert!(timestamp_within_window(now - 300, now));
        assert!(timestamp_within_window(now + 300, now));
        assert!(!timestamp_within_window(now - 301, now));
        assert!(!timestamp_within_window(now + 301, now));
    }
}
