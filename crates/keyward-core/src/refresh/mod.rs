//! Credential refresh: the single-flight exchange and the pipeline hook that
//! triggers it on 401.

pub mod coordinator;
pub mod retry;

pub use coordinator::{RefreshCoordinator, RefreshError, RefreshOutcome, RefreshPhase};
pub use retry::RefreshOnUnauthorized;
