use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use reqwest::header::{self, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::events::{SessionEvent, SessionEvents};
use crate::api::error::server_detail;
use crate::api::{
    ApiError, ApiRequest, ApiResponse, BearerAuth, HttpTransport, RequestPipeline, TraceRequests,
};
use crate::auth::{Credential, CredentialStore, DefaultHeaders, SessionData, UserProfile};
use crate::config::{AuthEndpoints, AuthScheme, Config};
use crate::refresh::{RefreshCoordinator, RefreshOnUnauthorized};

/// Shown when the server gave no reason of its own.
const LOGIN_FAILED_MESSAGE: &str = "Login failed";

const SESSION_EXPIRED_MESSAGE: &str = "Session expired. Please log in again.";

#[derive(Clone, Serialize)]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
}

impl LoginCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    Success(UserProfile),
    /// User-facing reason, taken from the server when it sent one.
    Failure(String),
}

impl LoginOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, LoginOutcome::Success(_))
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            LoginOutcome::Success(_) => None,
            LoginOutcome::Failure(message) => Some(message),
        }
    }
}

/// Account creation payload. Server-specific fields go in `extra`.
#[derive(Clone, Serialize)]
pub struct Registration {
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("username", &self.username)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(alias = "token", alias = "access_token")]
    access: String,
    #[serde(default, alias = "refresh_token")]
    refresh: Option<String>,
    user: UserProfile,
}

/// Point-in-time view of the session for display.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub authenticated: bool,
    pub user: Option<UserProfile>,
    pub loading: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct SessionStatus {
    loading: bool,
    last_error: Option<String>,
}

/// Login, logout and invalidation of the one process-wide session.
/// Clone is cheap; clones share the same session.
#[derive(Clone)]
pub struct SessionFacade {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<CredentialStore>,
    transport: Arc<dyn HttpTransport>,
    coordinator: Arc<RefreshCoordinator>,
    endpoints: AuthEndpoints,
    scheme: AuthScheme,
    events: SessionEvents,
    status: Mutex<SessionStatus>,
}

impl SessionFacade {
    pub fn new(
        config: &Config,
        transport: Arc<dyn HttpTransport>,
        store: Arc<CredentialStore>,
    ) -> Self {
        let endpoints = config.endpoints();
        let coordinator = Arc::new(RefreshCoordinator::new(
            transport.clone(),
            store.clone(),
            endpoints.refresh.clone(),
        ));
        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                coordinator,
                endpoints,
                scheme: config.auth_scheme,
                events: SessionEvents::new(),
                status: Mutex::new(SessionStatus::default()),
            }),
        }
    }

    /// Pipeline that attaches this session's credential and recovers from 401
    /// through this session's refresh coordinator.
    pub fn pipeline(&self) -> RequestPipeline {
        RequestPipeline::new(self.inner.transport.clone(), self.inner.store.headers().clone())
            .with(TraceRequests)
            .with(BearerAuth::new(self.inner.store.clone()))
            .with(RefreshOnUnauthorized::new(
                self.inner.coordinator.clone(),
                self.clone(),
            ))
    }

    /// Authenticate and, on success, replace the session.
    pub async fn login(&self, credentials: &LoginCredentials) -> LoginOutcome {
        {
            let mut status = self.status();
            status.loading = true;
            status.last_error = None;
        }

        let outcome = match self.request_session(credentials).await {
            Ok(data) => self.start_session(credentials, data),
            Err(message) => LoginOutcome::Failure(message),
        };

        let mut status = self.status();
        status.loading = false;
        status.last_error = outcome.message().map(str::to_string);
        outcome
    }

    async fn request_session(&self, credentials: &LoginCredentials) -> Result<SessionData, String> {
        let request = ApiRequest::post(&self.inner.endpoints.login)
            .json(credentials)
            .map_err(|e| {
                error!(error = %e, "Failed to build login request");
                LOGIN_FAILED_MESSAGE.to_string()
            })?
            .header(header::ACCEPT, HeaderValue::from_static("application/json"));

        let response = self.inner.transport.send(&request).await.map_err(|e| {
            error!(error = %e, "Login request failed");
            LOGIN_FAILED_MESSAGE.to_string()
        })?;

        if !response.is_success() {
            let message = server_detail(&response.body)
                .unwrap_or_else(|| LOGIN_FAILED_MESSAGE.to_string());
            warn!(status = response.status.as_u16(), "Login rejected");
            return Err(message);
        }

        let parsed: LoginResponse = response.json().map_err(|e| {
            error!(error = %e, "Failed to parse login response");
            LOGIN_FAILED_MESSAGE.to_string()
        })?;
        if parsed.access.is_empty() {
            error!("Login response carried an empty token");
            return Err(LOGIN_FAILED_MESSAGE.to_string());
        }
        if let Err(e) = DefaultHeaders::bearer_value(&parsed.access) {
            error!(error = %e, "Login response carried an unusable token");
            return Err(LOGIN_FAILED_MESSAGE.to_string());
        }

        let refresh = match self.inner.scheme {
            AuthScheme::AccessRefresh => parsed.refresh.filter(|t| !t.is_empty()),
            AuthScheme::OpaqueToken => None,
        };
        Ok(SessionData::new(Credential::new(parsed.access, refresh), parsed.user))
    }

    fn start_session(&self, credentials: &LoginCredentials, data: SessionData) -> LoginOutcome {
        let user = data.user.clone();
        let token = data.credential.access_token.clone();
        if let Err(e) = self.inner.store.save(data) {
            // Only persistence may fail once the token is in memory.
            if self.inner.store.access_token().as_deref() != Some(token.as_str()) {
                error!(error = %e, "Failed to start session");
                return LoginOutcome::Failure(LOGIN_FAILED_MESSAGE.to_string());
            }
            warn!(error = %e, "Failed to save session");
        }
        info!(username = %credentials.username, "Login successful");
        self.inner.events.emit(SessionEvent::LoggedIn);
        LoginOutcome::Success(user)
    }

    /// Clear the session and tell the server, ignoring what it answers.
    /// Safe to call without a session.
    pub async fn logout(&self) {
        let token = self.inner.store.access_token();
        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "Failed to remove stored session");
        }
        self.status().last_error = None;

        let Some(token) = token else {
            debug!("Logout without a session");
            return;
        };
        self.inner.events.emit(SessionEvent::LoggedOut);
        info!("Logged out");

        let request = match ApiRequest::post(&self.inner.endpoints.logout).bearer(&token) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Skipping logout notification");
                return;
            }
        };
        match self.send_direct(request).await {
            Ok(_) => debug!("Server acknowledged logout"),
            Err(e) => debug!(error = %e, "Logout notification failed (ignored)"),
        }
    }

    /// Clear the session locally after a terminal auth failure.
    ///
    /// Emits [`SessionEvent::AuthExpired`] only when a session was actually
    /// cleared, so requests failing together signal once. Returns whether
    /// that happened.
    pub fn invalidate(&self) -> bool {
        let cleared = match self.inner.store.clear() {
            Ok(cleared) => cleared,
            Err(e) => {
                warn!(error = %e, "Failed to remove stored session");
                true
            }
        };
        if cleared {
            warn!("Session invalidated, re-authentication required");
            self.status().last_error = Some(SESSION_EXPIRED_MESSAGE.to_string());
            self.inner.events.emit(SessionEvent::AuthExpired);
        }
        cleared
    }

    /// True while a credential is held. Only a 401 proves otherwise.
    pub fn is_authenticated(&self) -> bool {
        self.inner.store.has_credential()
    }

    /// Create an account. The current session is left as it is.
    pub async fn register(&self, registration: &Registration) -> Result<UserProfile, ApiError> {
        let request = ApiRequest::post(&self.inner.endpoints.register).json(registration)?;
        let response = self.send_direct(request).await?;
        let user: UserProfile = response.json()?;
        info!(username = %registration.username, "Account registered");
        Ok(user)
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.inner.store.user()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let status = self.status();
        SessionSnapshot {
            authenticated: self.inner.store.has_credential(),
            user: self.inner.store.user(),
            loading: status.loading,
            last_error: status.last_error.clone(),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.status().last_error.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.inner.coordinator
    }

    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.inner.endpoints
    }

    /// One request outside the pipeline: no credential attached, no refresh.
    async fn send_direct(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        request
            .headers
            .entry(header::ACCEPT)
            .or_insert(HeaderValue::from_static("application/json"));
        let response = self.inner.transport.send(&request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.text()))
        }
    }

    fn status(&self) -> MutexGuard<'_, SessionStatus> {
        self.inner.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::auth::{DefaultHeaders, MemoryStore};
    use crate::testing::{body_json, json_response, ScriptedTransport};

    fn facade_with(transport: ScriptedTransport, config: &Config) -> (SessionFacade, Arc<ScriptedTransport>) {
        let transport = Arc::new(transport);
        let store = Arc::new(CredentialStore::new(
            Box::new(MemoryStore::new()),
            DefaultHeaders::new(),
        ));
        (SessionFacade::new(config, transport.clone(), store), transport)
    }

    fn login_server() -> ScriptedTransport {
        ScriptedTransport::new(|request| {
            if request.url.ends_with("/auth/login/") {
                let body = body_json(request);
                if body["username"] == "a" && body["password"] == "b" {
                    Ok(json_response(200, json!({"token": "T1", "refresh": "R1", "user": {"id": 1}})))
                } else {
                    Ok(json_response(401, json!({"detail": "Invalid username or password"})))
                }
            } else if request.url.ends_with("/auth/logout/") {
                Ok(json_response(200, json!({"detail": "ok"})))
            } else {
                Ok(json_response(404, json!({})))
            }
        })
    }

    #[tokio::test]
    async fn test_login_success_populates_session() {
        let (facade, _) = facade_with(login_server(), &Config::default());
        let mut events = facade.subscribe();

        let outcome = facade.login(&LoginCredentials::new("a", "b")).await;

        assert!(outcome.is_success());
        assert!(facade.is_authenticated());
        assert_eq!(facade.user().unwrap().id(), Some(1));
        let credential = facade.store().credential().unwrap();
        assert_eq!(credential.access_token, "T1");
        assert_eq!(credential.refresh_token.as_deref(), Some("R1"));
        assert_eq!(
            facade.store().headers().get(&header::AUTHORIZATION).unwrap(),
            "Bearer T1"
        );
        assert_eq!(events.try_recv().unwrap(), SessionEvent::LoggedIn);

        let snapshot = facade.snapshot();
        assert!(!snapshot.loading);
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn test_login_failure_reports_server_detail() {
        let (facade, _) = facade_with(login_server(), &Config::default());

        let outcome = facade.login(&LoginCredentials::new("a", "wrong")).await;

        assert_eq!(outcome, LoginOutcome::Failure("Invalid username or password".into()));
        assert!(!facade.is_authenticated());
        assert!(facade.user().is_none());
        assert_eq!(facade.last_error().as_deref(), Some("Invalid username or password"));
    }

    #[tokio::test]
    async fn test_login_failure_without_detail_is_generic() {
        let offline = ScriptedTransport::new(|_| {
            Err(crate::api::TransportError::Other("connection refused".into()))
        });
        let (facade, _) = facade_with(offline, &Config::default());
        let outcome = facade.login(&LoginCredentials::new("a", "b")).await;
        assert_eq!(outcome.message(), Some(LOGIN_FAILED_MESSAGE));

        let html = ScriptedTransport::new(|_| Ok(ApiResponse::new(reqwest::StatusCode::BAD_GATEWAY, "<html>")));
        let (facade, _) = facade_with(html, &Config::default());
        let outcome = facade.login(&LoginCredentials::new("a", "b")).await;
        assert_eq!(outcome.message(), Some(LOGIN_FAILED_MESSAGE));
        assert!(!facade.is_authenticated());
    }

    #[tokio::test]
    async fn test_login_with_unusable_token_fails() {
        let server = ScriptedTransport::new(|_| {
            Ok(json_response(200, json!({"access": "T\n1", "refresh": "R1", "user": {"id": 1}})))
        });
        let (facade, _) = facade_with(server, &Config::default());
        let mut events = facade.subscribe();

        let outcome = facade.login(&LoginCredentials::new("a", "b")).await;

        assert_eq!(outcome.message(), Some(LOGIN_FAILED_MESSAGE));
        assert!(!facade.is_authenticated());
        assert!(facade.store().headers().get(&header::AUTHORIZATION).is_none());
        assert_eq!(facade.last_error().as_deref(), Some(LOGIN_FAILED_MESSAGE));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_opaque_scheme_drops_refresh_token() {
        let config = Config {
            auth_scheme: AuthScheme::OpaqueToken,
            ..Config::default()
        };
        let (facade, _) = facade_with(login_server(), &config);

        assert!(facade.login(&LoginCredentials::new("a", "b")).await.is_success());
        assert!(facade.store().credential().unwrap().refresh_token.is_none());
        assert!(!facade.coordinator().is_refreshable());
    }

    #[tokio::test]
    async fn test_logout_clears_and_notifies_server() {
        let (facade, transport) = facade_with(login_server(), &Config::default());
        facade.login(&LoginCredentials::new("a", "b")).await;
        let mut events = facade.subscribe();

        facade.logout().await;

        assert!(!facade.is_authenticated());
        assert!(facade.user().is_none());
        assert!(facade.store().headers().get(&header::AUTHORIZATION).is_none());
        let logouts = transport.requests_to("/auth/logout/");
        assert_eq!(logouts.len(), 1);
        assert_eq!(logouts[0].bearer_token(), Some("T1"));
        assert_eq!(events.try_recv().unwrap(), SessionEvent::LoggedOut);
    }

    #[tokio::test]
    async fn test_logout_ignores_server_failure() {
        let server = ScriptedTransport::new(|request| {
            if request.url.ends_with("/auth/login/") {
                Ok(json_response(200, json!({"access": "T1", "user": {"id": 1}})))
            } else {
                Err(crate::api::TransportError::Other("offline".into()))
            }
        });
        let (facade, _) = facade_with(server, &Config::default());
        facade.login(&LoginCredentials::new("a", "b")).await;

        facade.logout().await;

        assert!(!facade.is_authenticated());
    }

    #[tokio::test]
    async fn test_logout_without_session_is_idempotent() {
        let (facade, transport) = facade_with(login_server(), &Config::default());
        let mut events = facade.subscribe();

        facade.logout().await;
        facade.logout().await;

        assert!(!facade.is_authenticated());
        assert_eq!(transport.requests().len(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalidate_signals_once() {
        let (facade, transport) = facade_with(login_server(), &Config::default());
        facade.login(&LoginCredentials::new("a", "b")).await;
        let mut events = facade.subscribe();

        assert!(facade.invalidate());
        assert!(!facade.invalidate());

        assert!(!facade.is_authenticated());
        assert_eq!(events.try_recv().unwrap(), SessionEvent::AuthExpired);
        assert!(events.try_recv().is_err());
        assert_eq!(transport.count("/auth/logout/"), 0);
        assert_eq!(facade.last_error().as_deref(), Some(SESSION_EXPIRED_MESSAGE));
    }

    #[tokio::test]
    async fn test_register_returns_profile_without_session_change() {
        let server = ScriptedTransport::new(|request| {
            assert!(request.url.ends_with("/auth/register/"));
            Ok(json_response(201, json!({"id": 7, "username": "new"})))
        });
        let (facade, transport) = facade_with(server, &Config::default());

        let user = facade
            .register(&Registration {
                username: "new".into(),
                password: "pw".into(),
                email: Some("new@example.test".into()),
                extra: Map::new(),
            })
            .await
            .unwrap();

        assert_eq!(user.id(), Some(7));
        assert!(!facade.is_authenticated());
        assert_eq!(
            body_json(&transport.requests()[0]),
            json!({"username": "new", "password": "pw", "email": "new@example.test"})
        );
    }
}
