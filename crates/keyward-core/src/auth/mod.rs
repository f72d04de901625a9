//! Credential persistence for the process-wide session.
//!
//! This module provides:
//! - `CredentialStore`: the single writer of the session record
//! - `SessionData`, `Credential`, `UserProfile`: what a session holds
//! - `KeyValueStore` backends: memory, JSON file, OS keychain
//! - `DefaultHeaders`: headers every request starts from
//!
//! Sessions are persisted under `~/.cache/keyward/` (or the keychain) and are
//! never expired locally; only the server decides a token is stale.

pub mod credentials;
pub mod headers;
pub mod session;
pub mod storage;

pub use credentials::CredentialStore;
pub use headers::DefaultHeaders;
pub use session::{Credential, SessionData, UserProfile};
pub use storage::{open_backend, FileStore, KeyValueStore, KeyringStore, MemoryStore};
