use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Access token plus the optional refresh token issued alongside it.
///
/// The access token is attached verbatim. Whether it is still valid is only
/// ever learned from a 401, never computed locally.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
        }
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

// Tokens stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// The user record the server returns at login. Its shape belongs to the
/// server, so it is kept as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserProfile(Value);

impl UserProfile {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn id(&self) -> Option<i64> {
        self.get("id").and_then(Value::as_i64)
    }

    pub fn username(&self) -> Option<&str> {
        self.get("username").and_then(Value::as_str)
    }

    pub fn as_json(&self) -> &Value {
        &self.0
    }
}

/// Credential and profile, always set and cleared together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub credential: Credential,
    pub user: UserProfile,
    pub created_at: DateTime<Utc>,
}

impl SessionData {
    pub fn new(credential: Credential, user: UserProfile) -> Self {
        Self {
            credential,
            user,
            created_at: Utc::now(),
        }
    }

    pub fn token(&self) -> &str {
        &self.credential.access_token
    }

    /// Minutes since login (for display)
    pub fn minutes_since_login(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_credential_debug_redacts_tokens() {
        let credential = Credential::new("secret-access", Some("secret-refresh".to_string()));
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("secret-access"));
        assert!(!debug.contains("secret-refresh"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_credential_refreshable() {
        assert!(Credential::new("a", Some("r".to_string())).is_refreshable());
        assert!(!Credential::new("a", Some(String::new())).is_refreshable());
        assert!(!Credential::new("a", None).is_refreshable());
        assert_eq!(Credential::new("T1", None).bearer(), "Bearer T1");
    }

    #[test]
    fn test_user_profile_accessors() {
        let user = UserProfile::new(json!({"id": 1, "username": "a"}));
        assert_eq!(user.id(), Some(1));
        assert_eq!(user.username(), Some("a"));
        assert!(user.get("email").is_none());
    }
}
