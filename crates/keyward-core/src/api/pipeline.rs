//! Middleware pipeline every authenticated call goes through.
//!
//! Each attempt starts from the caller's request, picks up the process-wide
//! default headers, runs every hook's `before_send`, goes out over the
//! transport, gets its status classified, and then runs every hook's
//! `after_receive`. A hook may ask for the request to be replayed; the pipeline
//! allows that once per request.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{self, HeaderValue};
use tracing::{debug, warn};

use super::error::ApiError;
use super::request::{ApiRequest, ApiResponse};
use super::transport::HttpTransport;
use crate::auth::{CredentialStore, DefaultHeaders};

/// Upper bound on replays of one request, whatever the hooks ask for.
const MAX_REPLAYS: u32 = 1;

/// What an `after_receive` hook decided.
#[derive(Debug)]
pub enum Verdict {
    /// Hand this outcome to the next hook, or to the caller.
    Done(Result<ApiResponse, ApiError>),
    /// Send the request again. The error is returned if no replay is left.
    Replay(ApiError),
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn before_send(&self, _request: &mut ApiRequest) -> Result<(), ApiError> {
        Ok(())
    }

    /// `pending` is the request as the caller issued it (the one that gets
    /// replayed); `sent` is what actually went out, headers included.
    async fn after_receive(
        &self,
        _pending: &mut ApiRequest,
        _sent: &ApiRequest,
        outcome: Result<ApiResponse, ApiError>,
    ) -> Verdict {
        Verdict::Done(outcome)
    }
}

pub struct RequestPipeline {
    transport: Arc<dyn HttpTransport>,
    defaults: DefaultHeaders,
    hooks: Vec<Arc<dyn Middleware>>,
}

impl RequestPipeline {
    pub fn new(transport: Arc<dyn HttpTransport>, defaults: DefaultHeaders) -> Self {
        Self {
            transport,
            defaults,
            hooks: Vec::new(),
        }
    }

    /// Append a hook. Hooks run in insertion order at both stages.
    pub fn with(mut self, hook: impl Middleware + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn push(&mut self, hook: Arc<dyn Middleware>) {
        self.hooks.push(hook);
    }

    pub fn hook_names(&self) -> Vec<&'static str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut pending = request;
        let mut replays = 0;

        loop {
            let mut outgoing = pending.clone();
            self.defaults.apply_to(&mut outgoing.headers);
            for hook in &self.hooks {
                hook.before_send(&mut outgoing).await?;
            }

            let outcome = self.dispatch(&outgoing).await;
            match self.after_receive(&mut pending, &outgoing, outcome).await {
                Verdict::Done(outcome) => return outcome,
                Verdict::Replay(err) if replays >= MAX_REPLAYS => {
                    warn!(url = %pending.url, "Replay limit reached");
                    return Err(err);
                }
                Verdict::Replay(_) => {
                    replays += 1;
                    debug!(method = %pending.method, url = %pending.url, "Replaying request");
                }
            }
        }
    }

    async fn after_receive(
        &self,
        pending: &mut ApiRequest,
        sent: &ApiRequest,
        mut outcome: Result<ApiResponse, ApiError>,
    ) -> Verdict {
        for hook in &self.hooks {
            match hook.after_receive(pending, sent, outcome).await {
                Verdict::Done(next) => outcome = next,
                replay => return replay,
            }
        }
        Verdict::Done(outcome)
    }

    async fn dispatch(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let response = self.transport.send(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.text()))
        }
    }
}

/// Debug line per request, warning per failure.
pub struct TraceRequests;

#[async_trait]
impl Middleware for TraceRequests {
    fn name(&self) -> &'static str {
        "trace"
    }

    async fn before_send(&self, request: &mut ApiRequest) -> Result<(), ApiError> {
        debug!(
            method = %request.method,
            url = %request.url,
            authenticated = request.headers.contains_key(header::AUTHORIZATION),
            retried = request.is_retried(),
            "API request"
        );
        Ok(())
    }

    async fn after_receive(
        &self,
        _pending: &mut ApiRequest,
        sent: &ApiRequest,
        outcome: Result<ApiResponse, ApiError>,
    ) -> Verdict {
        if let Err(ref e) = outcome {
            warn!(method = %sent.method, url = %sent.url, status = ?e.status(), error = %e, "API request failed");
        }
        Verdict::Done(outcome)
    }
}

/// Attaches the session's current access token.
pub struct BearerAuth {
    store: Arc<CredentialStore>,
}

impl BearerAuth {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Middleware for BearerAuth {
    fn name(&self) -> &'static str {
        "bearer"
    }

    async fn before_send(&self, request: &mut ApiRequest) -> Result<(), ApiError> {
        if let Some(token) = self.store.access_token() {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::InvalidRequest("Token is not a valid header value".into()))?;
            value.set_sensitive(true);
            request.headers.insert(header::AUTHORIZATION, value);
        }
        Ok(())
    }
}
