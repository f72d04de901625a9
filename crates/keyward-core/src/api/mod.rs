//! HTTP side of the session manager.
//!
//! This module provides the `RequestPipeline` every authenticated call goes
//! through, the `HttpTransport` it sends with, and `ApiClient`, a JSON
//! convenience layer over both.
//!
//! The API uses bearer token authentication; tokens are obtained through
//! `SessionFacade::login` and refreshed by the pipeline on 401.

pub mod client;
pub mod error;
pub mod pipeline;
pub mod request;
pub mod transport;

pub use client::ApiClient;
pub use error::{ApiError, TransportError};
pub use pipeline::{BearerAuth, Middleware, RequestPipeline, TraceRequests, Verdict};
pub use request::{ApiRequest, ApiResponse};
pub use transport::{HttpTransport, ReqwestTransport};
