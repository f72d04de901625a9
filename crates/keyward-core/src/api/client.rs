//! JSON API client bound to the session.
//!
//! This module provides the `ApiClient` struct: URL building from the
//! configuration plus typed helpers over the session's request pipeline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::ApiError;
use super::pipeline::RequestPipeline;
use super::request::{ApiRequest, ApiResponse};
use super::transport::{HttpTransport, ReqwestTransport};
use crate::auth::{open_backend, CredentialStore, DefaultHeaders, UserProfile};
use crate::config::Config;
use crate::session::SessionFacade;

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    valid: bool,
    user: UserProfile,
}

/// Clone is cheap - clones share the session and the pipeline.
#[derive(Clone)]
pub struct ApiClient {
    config: Config,
    session: SessionFacade,
    pipeline: Arc<RequestPipeline>,
}

impl ApiClient {
    /// Build a client with the reqwest transport and the configured storage,
    /// restoring any persisted session.
    pub fn new(config: Config) -> Result<Self> {
        let transport = ReqwestTransport::new(Duration::from_secs(config.request_timeout_secs))?;
        let store = CredentialStore::open(open_backend(&config)?, DefaultHeaders::new());
        Ok(Self::from_parts(config, Arc::new(transport), Arc::new(store)))
    }

    pub fn from_parts(
        config: Config,
        transport: Arc<dyn HttpTransport>,
        store: Arc<CredentialStore>,
    ) -> Self {
        let session = SessionFacade::new(&config, transport, store);
        let pipeline = Arc::new(session.pipeline());
        Self {
            config,
            session,
            pipeline,
        }
    }

    pub fn session(&self) -> &SessionFacade {
        &self.session
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn url(&self, path: &str) -> String {
        self.config.api_url(path)
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.pipeline.send(request).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send(ApiRequest::get(self.url(path))).await?;
        response.json()
    }

    pub async fn get_text(&self, path: &str) -> Result<String, ApiError> {
        let response = self.send(ApiRequest::get(self.url(path))).await?;
        Ok(response.text())
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let request = ApiRequest::post(self.url(path)).json(body)?;
        let response = self.send(request).await?;
        response.json()
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(ApiRequest::delete(self.url(path))).await?;
        Ok(())
    }

    /// Ask the server whether the credential is still good and refresh the
    /// cached profile from its answer.
    pub async fn verify(&self) -> Result<UserProfile, ApiError> {
        let url = self.session.endpoints().verify.clone();
        let response: VerifyResponse = self.send(ApiRequest::get(url)).await?.json()?;
        if !response.valid {
            return Err(ApiError::InvalidResponse("Server reported token as invalid".into()));
        }
        match self.session.store().replace_profile(response.user.clone()) {
            Ok(true) => debug!("Cached profile updated"),
            Ok(false) => debug!("Session ended before profile update"),
            Err(e) => warn!(error = %e, "Failed to persist profile"),
        }
        Ok(response.user)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::auth::MemoryStore;
    use crate::session::LoginCredentials;
    use crate::testing::{json_response, ScriptedTransport};

    fn client(transport: Arc<ScriptedTransport>) -> ApiClient {
        let store = Arc::new(CredentialStore::new(
            Box::new(MemoryStore::new()),
            DefaultHeaders::new(),
        ));
        ApiClient::from_parts(Config::default(), transport, store)
    }

    fn server() -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::new(|request| {
            let url = request.url.as_str();
            if url.ends_with("/auth/login/") {
                Ok(json_response(200, json!({"access": "T1", "refresh": "R1", "user": {"id": 1}})))
            } else if url.ends_with("/auth/verify/") {
                Ok(json_response(200, json!({"valid": true, "user": {"id": 1, "username": "a"}})))
            } else if url.ends_with("/tasks/") && request.method == reqwest::Method::POST {
                Ok(json_response(201, json!({"id": 9})))
            } else if url.ends_with("/tasks/9/") {
                Ok(json_response(204, json!(null)))
            } else {
                Ok(json_response(200, json!([{"id": 9}])))
            }
        }))
    }

    #[tokio::test]
    async fn test_json_helpers_use_configured_base_url() {
        let transport = server();
        let client = client(transport.clone());
        client.session().login(&LoginCredentials::new("a", "b")).await;

        let tasks: Vec<Value> = client.get_json("/tasks/").await.unwrap();
        assert_eq!(tasks[0]["id"], 9);

        let created: Value = client.post_json("/tasks/", &json!({"name": "x"})).await.unwrap();
        assert_eq!(created["id"], 9);

        client.delete("/tasks/9/").await.unwrap();

        let sent = transport.requests();
        assert!(sent.iter().skip(1).all(|r| r.url.starts_with("http://127.0.0.1:8888/api/")));
        assert!(sent.iter().skip(1).all(|r| r.bearer_token() == Some("T1")));
    }

    #[tokio::test]
    async fn test_verify_refreshes_cached_profile() {
        let client = client(server());
        client.session().login(&LoginCredentials::new("a", "b")).await;
        assert!(client.session().user().unwrap().username().is_none());

        let user = client.verify().await.unwrap();

        assert_eq!(user.username(), Some("a"));
        assert_eq!(client.session().user().unwrap().username(), Some("a"));
    }
}
