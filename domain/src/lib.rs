//! Registration use cases and callback delivery.
//!
//! Consumers of the `domain` crate do not need to depend on `entity_api` or
//! `relay` directly: the registration types and the session manager are
//! re-exported here.

pub use entity_api::{registrations, Id, RegistrationKey};
pub use relay::{SessionManager, SessionState, StartOutcome};

pub mod error;
pub mod gateway;
pub mod registration;
