//! keyward-core: client-side session management for token-authenticated APIs.
//!
//! Holds the current credential, attaches it to every request, and when the
//! server answers 401 refreshes the credential once (shared by every request
//! that failed together) and replays the request. Callers only see a failure
//! when the refresh itself fails, at which point the session is cleared and
//! [`session::SessionEvent::AuthExpired`] is emitted.
//!
//! ```no_run
//! use keyward_core::{ApiClient, Config, LoginCredentials};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let client = ApiClient::new(Config::load()?)?;
//! if !client.session().is_authenticated() {
//!     client.session().login(&LoginCredentials::new("a", "b")).await;
//! }
//! let tasks: serde_json::Value = client.get_json("/tasks/").await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod refresh;
pub mod session;

#[cfg(test)]
mod testing;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse, HttpTransport, RequestPipeline};
pub use auth::{Credential, CredentialStore, SessionData, UserProfile};
pub use config::{AuthScheme, Config, StorageBackend};
pub use refresh::{RefreshCoordinator, RefreshError};
pub use session::{LoginCredentials, LoginOutcome, SessionEvent, SessionFacade};
