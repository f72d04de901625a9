use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use reqwest::header::{self, HeaderMap, HeaderValue};

/// Headers applied to every outgoing request unless the request sets its own.
///
/// The credential store keeps `Authorization` in here in step with the session,
/// so requests pick up the credential without passing it explicitly.
/// Clone is cheap and clones share the same map.
#[derive(Clone, Debug)]
pub struct DefaultHeaders {
    inner: Arc<RwLock<HeaderMap>>,
}

impl Default for DefaultHeaders {
    fn default() -> Self {
        let mut map = HeaderMap::new();
        map.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        map.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }
}

impl DefaultHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Authorization` value for `token`. Fails for tokens that cannot be sent
    /// in a header, such as ones containing control characters.
    pub fn bearer_value(token: &str) -> Result<HeaderValue> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
            .context("Access token is not a valid header value")?;
        value.set_sensitive(true);
        Ok(value)
    }

    pub fn set_bearer(&self, token: &str) -> Result<()> {
        let value = Self::bearer_value(token)?;
        self.write().insert(header::AUTHORIZATION, value);
        Ok(())
    }

    pub fn clear_bearer(&self) {
        self.write().remove(header::AUTHORIZATION);
    }

    pub fn insert(&self, name: header::HeaderName, value: HeaderValue) {
        self.write().insert(name, value);
    }

    pub fn get(&self, name: &header::HeaderName) -> Option<HeaderValue> {
        self.read().get(name).cloned()
    }

    /// Copy defaults into `headers` without overriding what is already there.
    pub fn apply_to(&self, headers: &mut HeaderMap) {
        for (name, value) in self.read().iter() {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HeaderMap> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HeaderMap> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
