//! HMAC bearer tokens for switchboard.
//!
//! A token carries the identity it was issued for and an expiry, signed with
//! a server secret. Format: `hex(claims-json) "." hex(HMAC-SHA256)`.

use crate::error::{SbError, SbResult};
use crate::identity::{Identity, Role};
use ring::hmac;
use serde::{Deserialize, Serialize};

/// Signed token contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Identity id.
    pub sub: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
}

impl Claims {
    pub fn into_identity(self) -> Identity {
        Identity {
            id: self.sub,
            role: self.role,
            display_name: self.name,
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Issue a bearer token for `identity`, valid for `ttl_secs`.
pub fn create_token(secret: &[u8], identity: &Identity, ttl_secs: u64) -> SbResult<String> {
    let claims = Claims {
        sub: identity.id.clone(),
        role: identity.role,
        name: identity.display_name.clone(),
        exp: now_secs().saturating_add(ttl_secs),
    };
    let body = serde_json::to_vec(&claims)?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &body);

    Ok(format!("{}.{}", hex::encode(&body), hex::encode(tag.as_ref())))
}

/// Verify a bearer token and return its claims.
///
/// Checks the HMAC signature first, then the expiry.
pub fn verify_token(secret: &[u8], token: &str) -> SbResult<Claims> {
    let (body_hex, tag_hex) = token
        .split_once('.')
        .ok_or_else(|| SbError::Token("malformed token".into()))?;

    let body = hex::decode(body_hex).map_err(|_| SbError::Token("malformed token body".into()))?;
    let tag = hex::decode(tag_hex).map_err(|_| SbError::Token("malformed token tag".into()))?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, &body, &tag).map_err(|_| SbError::Token("invalid token signature".into()))?;

    let claims: Claims = serde_json::from_slice(&body)
        .map_err(|e| SbError::Token(format!("invalid token claims: {e}")))?;

    if now_secs() > claims.exp {
        return Err(SbError::Token("token expired".into()));
    }

    Ok(claims)
}

/// Generate a random server secret (32 bytes).
pub fn generate_secret() -> SbResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret)
        .map_err(|_| SbError::Other("RNG failure".into()))?;
    Ok(secret)
}
