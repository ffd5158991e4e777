use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

use crate::pkce;

/// Opaque session identifier carried in the session cookie.
///
/// Generated from 256 random bits; never derived from user data.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a fresh random session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(pkce::random_token())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// The id is a bearer credential; keep it out of debug output.
impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "SessionId({prefix}…)")
    }
}

/// Subject identifier (`sub` claim) of the authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct Subject(pub String);

impl Subject {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Subject {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_session_ids_differ() {
        assert_ne!(SessionId::generate(), SessionId::generate());
        assert_eq!(SessionId::generate().as_str().len(), 43);
    }

    #[test]
    fn session_id_debug_is_truncated() {
        let id = SessionId::from("abcdefghijklmnop".to_string());
        assert_eq!(format!("{id:?}"), "SessionId(abcdef…)");
        assert_eq!(id.to_string(), "abcdefghijklmnop");
    }

    #[test]
    fn subject_serde_is_transparent() {
        let subject = Subject::from("f1b2c3");
        let json = serde_json::to_string(&subject).unwrap();
        assert_eq!(json, "\"f1b2c3\"");
    }

    #[test]
    fn newtypes_prevent_mixing() {
        fn takes_subject(_: &Subject) {}
        fn takes_session_id(_: &SessionId) {}

        takes_subject(&Subject::from("id"));
        takes_session_id(&SessionId::from("id".to_string()));
    }
}
