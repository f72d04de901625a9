//! Public session surface used by login/logout flows.
//!
//! `SessionFacade` owns the wiring: it builds the refresh coordinator from the
//! configured endpoints and hands out request pipelines bound to the session.
//! Terminal auth failures reach the application as `SessionEvent::AuthExpired`.

pub mod events;
pub mod facade;

pub use events::{SessionEvent, SessionEvents};
pub use facade::{
    LoginCredentials, LoginOutcome, Registration, SessionFacade, SessionSnapshot,
};
