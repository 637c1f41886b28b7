//! Credential verification.
//!
//! The gateway only needs a credential turned into an [`Identity`]; how that
//! happens is behind [`CredentialVerifier`] so deployments can plug in their
//! own identity service. [`HmacTokenVerifier`] checks the gateway's own
//! signed bearer tokens.

use std::future::Future;
use std::pin::Pin;
use switchboard_core::{verify_token, Identity, SbError, SbResult};
use tracing::debug;

pub type VerifyFuture<'a> = Pin<Box<dyn Future<Output = SbResult<Identity>> + Send + 'a>>;

/// Turns a bearer credential into an identity, or fails.
pub trait CredentialVerifier: Send + Sync {
    fn verify<'a>(&'a self, credential: &'a str) -> VerifyFuture<'a>;
}

/// Verifies tokens minted by [`switchboard_core::create_token`].
pub struct HmacTokenVerifier {
    secret: Vec<u8>,
}

impl HmacTokenVerifier {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }
}

impl CredentialVerifier for HmacTokenVerifier {
    fn verify<'a>(&'a self, credential: &'a str) -> VerifyFuture<'a> {
        Box::pin(async move {
            let credential = credential.trim();
            if credential.is_empty() {
                return Err(SbError::AuthFailed("empty credential".into()));
            }
            let claims = verify_token(&self.secret, credential)?;
            debug!(sub = %claims.sub, role = %claims.role, "credential verified");
            Ok(claims.into_identity())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::{create_token, Role};

    #[tokio::test]
    async fn accepts_own_tokens() {
        let secret = b"verifier-test-secret".to_vec();
        let identity = Identity::new("alice", Role::Standard).with_display_name("Alice");
        let token = create_token(&secret, &identity, 60).unwrap();

        let verifier = HmacTokenVerifier::new(secret);
        let got = verifier.verify(&token).await.unwrap();
        assert_eq!(got.id, "alice");
        assert_eq!(got.role, Role::Standard);
        assert_eq!(got.display_name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn rejects_foreign_and_empty_tokens() {
        let identity = Identity::new("alice", Role::Privileged);
        let token = create_token(b"other-secret", &identity, 60).unwrap();

        let verifier = HmacTokenVerifier::new(b"verifier-test-secret".to_vec());
        assert!(verifier.verify(&token).await.is_err());
        assert!(verifier.verify("   ").await.is_err());
        assert!(verifier.verify("not-a-token").await.is_err());
    }
}
