use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::headers::DefaultHeaders;
use super::session::{Credential, SessionData, UserProfile};
use super::storage::KeyValueStore;

const TOKEN_KEY: &str = "token";
const REFRESH_TOKEN_KEY: &str = "refreshToken";
const USER_KEY: &str = "user";
const CREATED_AT_KEY: &str = "createdAt";

const ALL_KEYS: [&str; 4] = [TOKEN_KEY, REFRESH_TOKEN_KEY, USER_KEY, CREATED_AT_KEY];

/// Holder of the process-wide session record.
///
/// This is the only writer of the session. Every write swaps the whole
/// [`SessionData`] under one lock, persists it through the backend, and keeps
/// the `Authorization` default header in step.
pub struct CredentialStore {
    backend: Box<dyn KeyValueStore>,
    headers: DefaultHeaders,
    current: RwLock<Option<SessionData>>,
}

impl CredentialStore {
    /// Create an empty store. Call [`CredentialStore::load`] to hydrate it.
    pub fn new(backend: Box<dyn KeyValueStore>, headers: DefaultHeaders) -> Self {
        Self {
            backend,
            headers,
            current: RwLock::new(None),
        }
    }

    /// Create a store and hydrate it from the backend. An unreadable record
    /// leaves the store empty.
    pub fn open(backend: Box<dyn KeyValueStore>, headers: DefaultHeaders) -> Self {
        let store = Self::new(backend, headers);
        match store.load() {
            Ok(Some(_)) => debug!("Session restored from storage"),
            Ok(None) => debug!("No stored session"),
            Err(e) => warn!(error = %e, "Failed to restore session"),
        }
        store
    }

    /// Read the persisted session into memory.
    ///
    /// Token and user must both be present; anything less is discarded so the
    /// session is never half populated.
    pub fn load(&self) -> Result<Option<SessionData>> {
        let token = self.backend.get(TOKEN_KEY)?;
        let user = self.backend.get(USER_KEY)?;

        let (token, user) = match (token, user) {
            (Some(token), Some(user)) if !token.is_empty() => (token, user),
            (None, None) => return Ok(None),
            _ => {
                warn!("Discarding incomplete stored session");
                self.backend.remove_all(&ALL_KEYS)?;
                return Ok(None);
            }
        };

        let user: UserProfile = match serde_json::from_str(&user) {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, "Discarding stored session with unreadable user");
                self.backend.remove_all(&ALL_KEYS)?;
                return Ok(None);
            }
        };
        let refresh_token = self.backend.get(REFRESH_TOKEN_KEY)?.filter(|t| !t.is_empty());
        let created_at = self
            .backend
            .get(CREATED_AT_KEY)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let data = SessionData {
            credential: Credential::new(token, refresh_token),
            user,
            created_at,
        };

        let mut current = self.write();
        self.headers.set_bearer(data.token())?;
        *current = Some(data.clone());
        Ok(Some(data))
    }

    /// Replace the whole session. Memory and headers are updated before the
    /// backend write, so a storage failure still leaves a usable session.
    pub fn save(&self, data: SessionData) -> Result<()> {
        let mut current = self.write();
        self.headers.set_bearer(data.token())?;
        let persisted = self.persist(&data);
        *current = Some(data);
        persisted
    }

    /// Swap in a credential obtained by spending `spent_refresh_token`, keeping
    /// the profile. A response without a refresh token keeps the existing one.
    ///
    /// Returns `false` when the session no longer holds `spent_refresh_token`
    /// (a logout, or a logout followed by another login, raced the refresh);
    /// the credential is dropped in that case.
    pub fn update_credential(
        &self,
        spent_refresh_token: &str,
        credential: Credential,
    ) -> Result<bool> {
        let mut current = self.write();
        let Some(existing) = current
            .as_ref()
            .filter(|d| d.credential.refresh_token.as_deref() == Some(spent_refresh_token))
        else {
            debug!("Session changed before refreshed credential arrived");
            return Ok(false);
        };

        let refresh_token = credential
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| existing.credential.refresh_token.clone());
        let data = SessionData {
            credential: Credential::new(credential.access_token, refresh_token),
            user: existing.user.clone(),
            created_at: existing.created_at,
        };

        self.headers.set_bearer(data.token())?;
        let persisted = self.persist(&data);
        *current = Some(data);
        persisted.map(|_| true)
    }

    /// Replace the cached profile of the current session.
    pub fn replace_profile(&self, user: UserProfile) -> Result<bool> {
        let mut current = self.write();
        let Some(existing) = current.as_ref() else {
            return Ok(false);
        };
        let data = SessionData {
            user,
            ..existing.clone()
        };
        let persisted = self.persist(&data);
        *current = Some(data);
        persisted.map(|_| true)
    }

    /// Drop the session from memory, headers and storage.
    /// Returns whether a session was present.
    pub fn clear(&self) -> Result<bool> {
        let mut current = self.write();
        let had_session = current.take().is_some();
        self.headers.clear_bearer();
        self.backend
            .remove_all(&ALL_KEYS)
            .context("Failed to remove stored session")?;
        Ok(had_session)
    }

    pub fn current(&self) -> Option<SessionData> {
        self.read().clone()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.read().as_ref().map(|d| d.credential.clone())
    }

    pub fn access_token(&self) -> Option<String> {
        self.read().as_ref().map(|d| d.credential.access_token.clone())
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.read().as_ref().map(|d| d.user.clone())
    }

    pub fn has_credential(&self) -> bool {
        self.read().is_some()
    }

    pub fn headers(&self) -> &DefaultHeaders {
        &self.headers
    }

    fn persist(&self, data: &SessionData) -> Result<()> {
        let user = serde_json::to_string(&data.user).context("Failed to serialize user")?;
        let mut entries = vec![
            (TOKEN_KEY, data.credential.access_token.clone()),
            (USER_KEY, user),
            (CREATED_AT_KEY, data.created_at.to_rfc3339()),
        ];
        match data.credential.refresh_token {
            Some(ref refresh) => entries.push((REFRESH_TOKEN_KEY, refresh.clone())),
            None => self.backend.remove(REFRESH_TOKEN_KEY)?,
        }
        self.backend
            .set_all(&entries)
            .context("Failed to persist session")
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<SessionData>> {
        self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<SessionData>> {
        self.current.write().unwrap_or_else(|e| e.into_inner())
    }
}
