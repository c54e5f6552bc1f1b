//! Purpose: Session state and the identity derived from it.
//! Exports: `Session`, `Identity`, `IdentityKey`, `token_fingerprint`.
//! Role: Decides guest vs authenticated; keys the remote query cache.
//! Invariants: Authenticated iff both access token and user id are present and non-empty.
//! Invariants: Raw tokens never appear in `Debug` output or logs; fingerprints do.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Session {
    pub fn guest() -> Self {
        Self::default()
    }

    pub fn authenticated(access_token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            user_id: Some(user_id.into()),
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        let token = self.access_token.as_deref().filter(|t| !t.is_empty())?;
        let user_id = self.user_id.as_deref().filter(|u| !u.is_empty())?;
        Some(Identity {
            key: IdentityKey(user_id.to_string()),
            access_token: token.to_string(),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity().is_some()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field(
                "access_token",
                &self.access_token.as_deref().map(token_fingerprint),
            )
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Cache key for one shopper's server cart. Token refreshes keep the same key.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self(user_id.into())
    }

    pub fn user_id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Identity {
    key: IdentityKey,
    access_token: String,
}

impl Identity {
    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub fn user_id(&self) -> &str {
        self.key.user_id()
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn fingerprint(&self) -> String {
        token_fingerprint(&self.access_token)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.key.user_id())
            .field("token", &self.fingerprint())
            .finish()
    }
}

/// Short, stable SHA-256 prefix safe to log in place of a token.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    format!("tok-{hex}")
}
