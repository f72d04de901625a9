use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{ApiRequest, HttpTransport};
use crate::auth::{Credential, CredentialStore, DefaultHeaders};

/// Why a refresh exchange produced no credential. Every variant is terminal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Session cannot be refreshed")]
    NotRefreshable,

    #[error("Refresh rejected with status {status}")]
    Rejected { status: u16 },

    #[error("Refresh request failed: {0}")]
    Transport(String),

    #[error("Malformed refresh response: {0}")]
    MalformedResponse(String),

    #[error("Session ended while refreshing")]
    SessionEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Refreshing,
    /// Outcome of the last exchange, until the next one starts.
    Settled { success: bool },
}

pub type RefreshOutcome = Result<Credential, RefreshError>;

type InFlightRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

enum State {
    Idle,
    Refreshing(InFlightRefresh),
    Settled(bool),
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "token", alias = "access_token")]
    access: String,
    #[serde(default, alias = "refresh_token")]
    refresh: Option<String>,
}

/// Runs refresh exchanges, at most one at a time.
///
/// Callers that ask for a refresh while one is running await the same shared
/// future instead of starting their own, so a refresh token is never spent
/// twice by requests that failed together.
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn HttpTransport>,
    store: Arc<CredentialStore>,
    /// `None` for deployments without a refresh exchange.
    endpoint: Option<String>,
    state: Mutex<State>,
    exchanges: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<CredentialStore>,
        endpoint: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                endpoint,
                state: Mutex::new(State::Idle),
                exchanges: AtomicU64::new(0),
            }),
        }
    }

    /// Obtain a fresh credential.
    ///
    /// `stale_token` is the access token the failing request carried. If the
    /// session already holds a different one, another caller refreshed in the
    /// meantime and that credential is returned without a new exchange.
    pub async fn refresh(&self, stale_token: Option<&str>) -> RefreshOutcome {
        let in_flight = {
            let mut state = self.inner.lock_state();
            let joined = match &*state {
                State::Refreshing(in_flight) => Some(in_flight.clone()),
                _ => None,
            };

            match joined {
                Some(in_flight) => {
                    debug!("Joining in-flight refresh");
                    in_flight
                }
                None => {
                    let credential = self.inner.store.credential();
                    if let (Some(current), Some(stale)) = (credential.as_ref(), stale_token) {
                        if current.access_token != stale {
                            debug!("Credential already rotated, skipping exchange");
                            return Ok(current.clone());
                        }
                    }

                    let refresh_token = credential
                        .and_then(|c| c.refresh_token)
                        .filter(|t| !t.is_empty());
                    let (Some(endpoint), Some(refresh_token)) =
                        (self.inner.endpoint.clone(), refresh_token)
                    else {
                        debug!("No refresh token or refresh endpoint");
                        *state = State::Settled(false);
                        return Err(RefreshError::NotRefreshable);
                    };

                    let inner = self.inner.clone();
                    let in_flight = async move { inner.exchange(endpoint, refresh_token).await }
                        .boxed()
                        .shared();
                    *state = State::Refreshing(in_flight.clone());
                    in_flight
                }
            }
        };

        in_flight.await
    }

    pub fn phase(&self) -> RefreshPhase {
        match &*self.inner.lock_state() {
            State::Idle => RefreshPhase::Idle,
            State::Refreshing(_) => RefreshPhase::Refreshing,
            State::Settled(success) => RefreshPhase::Settled { success: *success },
        }
    }

    pub fn is_refreshable(&self) -> bool {
        self.inner.endpoint.is_some()
            && self
                .inner
                .store
                .credential()
                .is_some_and(|c| c.is_refreshable())
    }

    /// Number of exchanges actually sent to the server.
    pub fn exchange_count(&self) -> u64 {
        self.inner.exchanges.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn exchange(&self, endpoint: String, refresh_token: String) -> RefreshOutcome {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        info!("Refreshing access token");

        let outcome = match self.request_credential(&endpoint, &refresh_token).await {
            Ok(credential) => self.store_credential(&refresh_token, credential),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(_) => info!("Access token refreshed"),
            Err(ref e) => warn!(error = %e, "Access token refresh failed"),
        }
        *self.lock_state() = State::Settled(outcome.is_ok());
        outcome
    }

    async fn request_credential(
        &self,
        endpoint: &str,
        refresh_token: &str,
    ) -> Result<Credential, RefreshError> {
        let request = ApiRequest::post(endpoint)
            .json(&json!({ "refresh": refresh_token }))
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        let response = self
            .transport
            .send(&request)
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        if !response.is_success() {
            return Err(RefreshError::Rejected {
                status: response.status.as_u16(),
            });
        }

        let parsed: RefreshResponse = serde_json::from_slice(&response.body)
            .map_err(|e| RefreshError::MalformedResponse(e.to_string()))?;
        if parsed.access.is_empty() {
            return Err(RefreshError::MalformedResponse("empty access token".into()));
        }
        DefaultHeaders::bearer_value(&parsed.access)
            .map_err(|e| RefreshError::MalformedResponse(e.to_string()))?;
        Ok(Credential::new(
            parsed.access,
            parsed.refresh.filter(|t| !t.is_empty()),
        ))
    }

    fn store_credential(&self, spent_refresh_token: &str, credential: Credential) -> RefreshOutcome {
        let access_token = credential.access_token.clone();
        match self.store.update_credential(spent_refresh_token, credential) {
            Ok(true) => {}
            Ok(false) => return Err(RefreshError::SessionEnded),
            Err(e) => {
                // A persistence failure still swaps the in-memory credential.
                if self.store.access_token().as_deref() != Some(access_token.as_str()) {
                    return Err(RefreshError::MalformedResponse(e.to_string()));
                }
                warn!(error = %e, "Failed to persist refreshed credential");
            }
        }
        match self.store.credential() {
            Some(current) if current.access_token == access_token => Ok(current),
            _ => Err(RefreshError::SessionEnded),
        }
    }
}
