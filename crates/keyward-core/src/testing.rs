//! In-process transport for tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use crate::api::{ApiRequest, ApiResponse, HttpTransport, TransportError};

type Handler = Box<dyn Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync>;

/// Answers every request with `handler`, records what was sent, and can hold
/// responses for URLs ending in a given suffix to widen race windows.
pub struct ScriptedTransport {
    handler: Handler,
    delays: Vec<(String, Duration)>,
    sent: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new(
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            delays: Vec::new(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn delay(mut self, url_suffix: &str, duration: Duration) -> Self {
        self.delays.push((url_suffix.to_string(), duration));
        self
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, url_suffix: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.ends_with(url_suffix))
            .count()
    }

    pub fn requests_to(&self, url_suffix: &str) -> Vec<ApiRequest> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.ends_with(url_suffix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.sent.lock().unwrap().push(request.clone());
        let delay = self
            .delays
            .iter()
            .find(|(suffix, _)| request.url.ends_with(suffix.as_str()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(request)
    }
}

pub fn json_response(status: u16, body: Value) -> ApiResponse {
    let status = StatusCode::from_u16(status).expect("valid status code");
    ApiResponse::new(status, serde_json::to_vec(&body).expect("serializable body"))
}

/// JSON body of a recorded request.
pub fn body_json(request: &ApiRequest) -> Value {
    request
        .body
        .as_deref()
        .map(|b| serde_json::from_slice(b).expect("JSON body"))
        .unwrap_or(Value::Null)
}
