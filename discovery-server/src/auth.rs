//! Request authentication
//!
//! - Session passwords are stored as PBKDF2-HMAC-SHA256 hashes with a random
//!   salt, never in the clear.
//! - Create/join requests may carry an Ed25519 signature over a timestamped
//!   payload; with `require_server_identity` the signature is mandatory.
//! - TURN credentials follow the shared-secret REST scheme:
//!   username `"{expiry}:{session_id_hex}"`, password
//!   `base64(HMAC-SHA1(secret, username))`.

use std::fmt;
use std::num::NonZeroU32;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::rand::{SecureRandom, SystemRandom};
use ring::{hmac, pbkdf2};

use session_core::identity;
use session_core::protocol::{SessionCreate, SessionId, SessionJoin};

// ============================================================================
// Types
// ============================================================================

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MissingSignature,
    StaleTimestamp,
    BadSignature,
    Rng,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingSignature => write!(f, "identity signature required"),
            AuthError::StaleTimestamp => write!(f, "request timestamp outside the allowed window"),
            AuthError::BadSignature => write!(f, "signature does not verify"),
            AuthError::Rng => write!(f, "system RNG unavailable"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Salted password hash
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordHash {
    salt: [u8; SALT_LEN],
    hash: [u8; HASH_LEN],
}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordHash(..)")
    }
}

fn iterations() -> NonZeroU32 {
    NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN)
}

impl PasswordHash {
    pub fn new(rng: &SystemRandom, password: &str) -> Result<Self, AuthError> {
        let mut salt = [0u8; SALT_LEN];
        rng.fill(&mut salt).map_err(|_| AuthError::Rng)?;
        let mut hash = [0u8; HASH_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations(),
            &salt,
            password.as_bytes(),
            &mut hash,
        );
        Ok(Self { salt, hash })
    }

    /// Constant-time check
    pub fn verify(&self, password: &str) -> bool {
        pbkdf2::verify(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations(),
            &self.salt,
            password.as_bytes(),
            &self.hash,
        )
        .is_ok()
    }
}

// ============================================================================
// Signatures
// ============================================================================

fn check_signature(
    pubkey: Option<&[u8; 32]>,
    timestamp: u64,
    signature: &[u8],
    payload: &[u8],
    required: bool,
    now: u64,
) -> Result<(), AuthError> {
    let Some(pubkey) = pubkey else {
        return if required {
            Err(AuthError::MissingSignature)
        } else {
            Ok(())
        };
    };
    if signature.is_empty() {
        return if required {
            Err(AuthError::MissingSignature)
        } else {
            Ok(())
        };
    }
    if !identity::timestamp_within_window(timestamp, now) {
        return Err(AuthError::StaleTimestamp);
    }
    if !identity::verify(pubkey, payload, signature) {
        return Err(AuthError::BadSignature);
    }
    Ok(())
}

/// Signatures that are present are always checked; absent ones only fail when required
pub fn verify_create(req: &SessionCreate, required: bool, now: u64) -> Result<(), AuthError> {
    let payload =
        identity::create_signing_payload(req.timestamp, req.capabilities, req.max_participants);
    check_signature(
        req.identity_pubkey.as_ref(),
        req.timestamp,
        &req.signature,
        &payload,
        required,
        now,
    )
}

pub fn verify_join(req: &SessionJoin, required: bool, now: u64) -> Result<(), AuthError> {
    let payload = identity::join_signing_payload(req.timestamp, &req.session_string);
    check_signature(
        req.identity_pubkey.as_ref(),
        req.timestamp,
        &req.signature,
        &payload,
        required,
        now,
    )
}

// ============================================================================
// TURN credentials
// ============================================================================

pub fn turn_credentials(
    secret: &str,
    session_id: &SessionId,
    now: u64,
    ttl_secs: u64,
) -> (String, String) {
    let username = format!("{}:{}", now + ttl_secs, hex::encode(session_id));
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret.as_bytes());
    let tag = hmac::sign(&key, username.as_bytes());
    (username, BASE64.encode(tag.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_core::identity::Identity;

    #[test]
    fn test_password_hash_verify() {
        let rng = SystemRandom::new();
        let h = PasswordHash::new(&rng, "hunter2").unwrap();
        assert!(h.verify("hunter2"));
        assert!(!h.verify("hunter3"));
        assert!(!h.verify(""));
    }

    #[test]
    fn test_password_hashes_are_salted() {
        let rng = SystemRandom::new();
        let a = PasswordHash::new(&rng, "same").unwrap();
        let b = PasswordHash::new(&rng, "same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_signed_create() {
        let id = Identity::generate().unwrap();
        let now = 1_700_000_000;
        let mut req = SessionCreate {
            capabilities: 3,
            max_participants: 4,
            identity_pubkey: Some(id.public_key()),
            timestamp: now,
            ..Default::default()
        };
        req.signature = id
            .sign(&identity::create_signing_payload(now, 3, 4))
            .to_vec();

        assert_eq!(verify_create(&req, true, now + 10), Ok(()));
        assert_eq!(
            verify_create(&req, true, now + 1_000),
            Err(AuthError::StaleTimestamp)
        );

        req.max_participants = 5;
        assert_eq!(verify_create(&req, true, now), Err(AuthError::BadSignature));
    }

    #[test]
    fn test_unsigned_join() {
        let req = SessionJoin {
            session_string: "calm-lake-tree".to_string(),
            ..Default::default()
        };
        assert_eq!(verify_join(&req, false, 0), Ok(()));
        assert_eq!(verify_join(&req, true, 0), Err(AuthError::MissingSignature));
    }

    #[test]
    fn test_turn_credentials_shape() {
        let (user, pass) = turn_credentials("secret", &[0xab; 16], 1_000, 60);
        assert_eq!(user, format!("1060:{}", "ab".repeat(16)));
        // 20-byte SHA-1 tag in base64
        assert_eq!(pass.len(), 28);
        let (_, again) = turn_credentials("secret", &[0xab; 16], 1_000, 60);
        assert_eq!(pass, again);
    }
}
