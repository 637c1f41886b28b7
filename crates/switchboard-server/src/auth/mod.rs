//! Connection authentication.

pub mod verifier;

pub use verifier::{CredentialVerifier, HmacTokenVerifier, VerifyFuture};
