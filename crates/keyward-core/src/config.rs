//! Client configuration management.
//!
//! This module handles loading and saving the client configuration, which
//! includes the backend address, the auth scheme the deployment uses, and
//! where the session is persisted.
//!
//! Configuration is stored at `~/.config/keyward/config.json`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "keyward";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_BACKEND_HOST: &str = "http://127.0.0.1:8888";
const DEFAULT_API_BASE_PATH: &str = "/api";

/// HTTP request timeout in seconds, applied by the transport.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const ENV_BACKEND_HOST: &str = "KEYWARD_BACKEND_HOST";
const ENV_API_BASE_PATH: &str = "KEYWARD_API_BASE_PATH";
const ENV_AUTH_SCHEME: &str = "KEYWARD_AUTH_SCHEME";

/// Token scheme of the deployment. Exactly one is in effect at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// Short-lived access token plus a refresh token exchangeable for a new one.
    #[default]
    AccessRefresh,
    /// A single opaque token; a 401 is always terminal.
    OpaqueToken,
}

impl AuthScheme {
    pub fn supports_refresh(self) -> bool {
        matches!(self, AuthScheme::AccessRefresh)
    }
}

impl std::str::FromStr for AuthScheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "access_refresh" | "jwt" => Ok(AuthScheme::AccessRefresh),
            "opaque_token" | "token" => Ok(AuthScheme::OpaqueToken),
            other => Err(anyhow::anyhow!("Unknown auth scheme: {}", other)),
        }
    }
}

/// Where the session survives process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend_host: String,
    pub api_base_path: String,
    pub request_timeout_secs: u64,
    pub auth_scheme: AuthScheme,
    pub storage: StorageBackend,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_host: DEFAULT_BACKEND_HOST.to_string(),
            api_base_path: DEFAULT_API_BASE_PATH.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            auth_scheme: AuthScheme::default(),
            storage: StorageBackend::default(),
            last_username: None,
        }
    }
}

/// Absolute URLs of the credential-issuing endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEndpoints {
    pub login: String,
    /// `None` when the deployment has no refresh exchange.
    pub refresh: Option<String>,
    pub logout: String,
    pub register: String,
    pub verify: String,
}

impl Config {
    /// Load the config file, falling back to defaults, then apply env overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var(ENV_BACKEND_HOST) {
            self.backend_host = host;
        }
        if let Ok(base) = std::env::var(ENV_API_BASE_PATH) {
            self.api_base_path = base;
        }
        if let Ok(scheme) = std::env::var(ENV_AUTH_SCHEME) {
            self.auth_scheme = scheme.parse()?;
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Full URL for an API path such as `/tasks/`.
    pub fn api_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let host = self.backend_host.trim_end_matches('/');
        let base = self.api_base_path.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}{}", host, base, path)
        } else {
            format!("{}{}/{}", host, base, path)
        }
    }

    pub fn endpoints(&self) -> AuthEndpoints {
        AuthEndpoints {
            login: self.api_url("/auth/login/"),
            refresh: self
                .auth_scheme
                .supports_refresh()
                .then(|| self.api_url("/auth/token/refresh/")),
            logout: self.api_url("/auth/logout/"),
            register: self.api_url("/auth/register/"),
            verify: self.api_url("/auth/verify/"),
        }
    }
}
