//! Ed25519 envelope signing.
//!
//! The signed bytes are `payload ++ routing_key ++ user`, appended directly
//! with no delimiters or hashing. Peers recompute exactly this concatenation.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, SECRET_KEY_LENGTH};
use tracing::{debug, warn};

/// Why an envelope goes out unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsignedReason {
    /// No signing key configured for the environment.
    NoKey,
    /// The key is not hex, or not a 32-byte seed.
    MalformedKey,
    /// A key is configured but no user identity resolves.
    NoUser,
}

/// Outcome of signing one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signing {
    Signed { origin: String, signature: String },
    Unsigned(UnsignedReason),
}

impl Signing {
    pub fn is_signed(&self) -> bool {
        matches!(self, Signing::Signed { .. })
    }
}

/// Key material and user resolved for an environment.
///
/// Resolution never fails: anything unusable downgrades to [`Disabled`]
/// and every envelope is sent unsigned.
///
/// [`Disabled`]: SigningIdentity::Disabled
#[derive(Clone)]
pub enum SigningIdentity {
    Ready { key: SigningKey, user: String },
    Disabled(UnsignedReason),
}

impl SigningIdentity {
    pub fn resolve(seed_hex: Option<&str>, user: Option<&str>) -> Self {
        let Some(seed_hex) = seed_hex else {
            debug!("No signing key configured, messages will be unsigned");
            return SigningIdentity::Disabled(UnsignedReason::NoKey);
        };

        let Some(key) = decode_seed(seed_hex) else {
            warn!("Signing key is not a hex-encoded 32-byte seed, messages will be unsigned");
            return SigningIdentity::Disabled(UnsignedReason::MalformedKey);
        };

        match user {
            Some(user) => SigningIdentity::Ready {
                key,
                user: user.to_string(),
            },
            None => {
                warn!("Signing key configured without a user, messages will be unsigned");
                SigningIdentity::Disabled(UnsignedReason::NoUser)
            }
        }
    }

    /// An identity that never signs.
    pub fn unsigned() -> Self {
        SigningIdentity::Disabled(UnsignedReason::NoKey)
    }

    pub fn sign(&self, payload: &[u8], routing_key: &str) -> Signing {
        match self {
            SigningIdentity::Ready { key, user } => Signing::Signed {
                origin: user.clone(),
                signature: signature_for(key, payload, routing_key, user),
            },
            SigningIdentity::Disabled(reason) => Signing::Unsigned(*reason),
        }
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningIdentity::Ready { user, .. } => f
                .debug_struct("Ready")
                .field("user", user)
                .finish_non_exhaustive(),
            SigningIdentity::Disabled(reason) => f.debug_tuple("Disabled").field(reason).finish(),
        }
    }
}

/// Sign with a hex seed in one step.
pub fn sign(seed_hex: &str, payload: &[u8], routing_key: &str, user: &str) -> Signing {
    SigningIdentity::resolve(Some(seed_hex), Some(user)).sign(payload, routing_key)
}

/// The exact byte sequence covered by the signature.
pub fn signed_bytes(payload: &[u8], routing_key: &str, user: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(payload.len() + routing_key.len() + user.len());
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(routing_key.as_bytes());
    bytes.extend_from_slice(user.as_bytes());
    bytes
}

fn signature_for(key: &SigningKey, payload: &[u8], routing_key: &str, user: &str) -> String {
    let signature = key.sign(&signed_bytes(payload, routing_key, user));
    URL_SAFE.encode(signature.to_bytes())
}

fn decode_seed(seed_hex: &str) -> Option<SigningKey> {
    let bytes = hex::decode(seed_hex.trim()).ok()?;
    let seed: [u8; SECRET_KEY_LENGTH] = bytes.try_into().ok()?;
    Some(SigningKey::from_bytes(&seed))
}
