//! Authenticated identities and their roles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role attached to an identity by the credential verifier.
///
/// Standard identities (customers) are quota-bound and own an offline queue.
/// Privileged identities (support agents) are unbounded and never queued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Standard,
    Privileged,
}

impl Role {
    pub fn is_privileged(self) -> bool {
        matches!(self, Role::Privileged)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Standard => "standard",
            Role::Privileged => "privileged",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" | "user" => Ok(Role::Standard),
            "privileged" | "admin" => Ok(Role::Privileged),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A verified identity: who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn is_privileged(&self) -> bool {
        self.role.is_privileged()
    }
}

/// Generate a random opaque identifier (16 bytes, hex-encoded).
pub fn generate_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_aliases() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Privileged);
        assert_eq!("USER".parse::<Role>().unwrap(), Role::Standard);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Privileged).unwrap();
        assert_eq!(json, "\"privileged\"");
    }

    #[test]
    fn generated_ids_are_unique_hex() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
