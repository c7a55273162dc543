/// Bearer-key authentication for the generation endpoint
use axum::http::{HeaderMap, header};
use subtle::ConstantTimeEq;

/// A wrapper around String that uses constant-time equality comparison
/// to prevent timing attacks on API key validation.
#[derive(Clone)]
pub struct ConstantTimeString(String);

impl std::fmt::Debug for ConstantTimeString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConstantTimeString(<redacted>)")
    }
}

impl From<String> for ConstantTimeString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConstantTimeString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl PartialEq for ConstantTimeString {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for ConstantTimeString {}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingCredentials,
    #[error("invalid bearer token")]
    InvalidCredentials,
    #[error("invalid key entry '{0}': expected user_id=key")]
    MalformedEntry(String),
}

/// API keys and the users they belong to.
#[derive(Clone, Default)]
pub struct KeyRing {
    keys: Vec<(ConstantTimeString, String)>,
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("users", &self.keys.iter().map(|(_, u)| u).collect::<Vec<_>>())
            .finish()
    }
}

impl KeyRing {
    /// Parse `user_id=key` entries, as given on the command line.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Result<Self, AuthError> {
        let mut ring = Self::default();
        for entry in entries {
            let entry = entry.as_ref();
            let (user_id, key) = entry
                .split_once('=')
                .map(|(u, k)| (u.trim(), k.trim()))
                .filter(|(u, k)| !u.is_empty() && !k.is_empty())
                .ok_or_else(|| AuthError::MalformedEntry(redact(entry)))?;
            ring = ring.with_key(user_id, key);
        }
        Ok(ring)
    }

    pub fn with_key(mut self, user_id: impl Into<String>, key: impl Into<String>) -> Self {
        self.keys
            .push((ConstantTimeString::from(key.into()), user_id.into()));
        self
    }

    /// Authentication is only enforced when at least one key is configured.
    pub fn is_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Resolve the `Authorization: Bearer` header to a user id.
    pub fn require_auth(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingCredentials)?;
        let presented = ConstantTimeString::from(token);

        // Compare against every key so timing does not reveal which one matched
        let mut user = None;
        for (key, user_id) in &self.keys {
            if *key == presented && user.is_none() {
                user = Some(user_id.clone());
            }
        }
        user.ok_or(AuthError::InvalidCredentials)
    }
}

fn redact(entry: &str) -> String {
    match entry.split_once('=') {
        Some((user, _)) => format!("{user}=<redacted>"),
        None => "<redacted>".to_string(),
    }
}
