//! Upstream streaming sessions for relayed push notifications.
//!
//! This crate owns one long-lived upstream streaming socket per registration,
//! keeps it alive across transient failures, expires registrations that are
//! not renewed and hands qualifying events to the event publisher.
//!
//! # Architecture
//!
//! - **Single session per registration**: the registry is keyed by
//!   `(instance_url, app_id, tag)` and never holds two live sessions for the
//!   same key, so an upstream stream is never opened (or delivered) twice.
//! - **Explicit state machine**: `Idle → Connecting → Open → Reconnecting →
//!   Terminated` with `Closing` while a socket is torn down. Transitions are a
//!   pure function of the current state and a trigger (`state::transition`).
//! - **Fixed-delay reconnect**: socket errors and abnormal closes are retried
//!   forever after a constant delay. A normal close from upstream ends the
//!   session and destroys the registration.
//! - **Renewal policy**: while open, a session re-reads its registration at
//!   most once per expiry-check interval and terminates when it has not been
//!   renewed within the renewal window.
//! - **Isolated delivery**: notifications go through a per-session ordered
//!   queue drained by a detached task, so a slow or failing callback never
//!   stalls the socket or affects the session.
//!
//! # Session Flow
//!
//! 1. `SessionManager::start` inserts a session handle into the registry
//!    (returning `AlreadyActive` for a key that is already live)
//! 2. The session task validates the registration against the app and
//!    instance tables; a rejection terminates it and destroys the registration
//! 3. The task connects to `<connect url>/api/v1/streaming/?access_token=…&stream=user`
//! 4. `notification` frames are published; everything else is dropped
//! 5. `SessionManager::stop` destroys the registration, cancels the task and
//!    waits for it to finish
//!
//! # Modules
//!
//! - `validator`: app, instance and token checks; connect URL resolution
//! - `state`: session states, triggers and the transition function
//! - `upstream`: socket traits and the `tokio-tungstenite` implementation
//! - `session`: the per-registration task
//! - `registry`: key → session map
//! - `manager`: facade used by the registration layer

pub mod error;
pub mod manager;
pub mod registry;
pub mod session;
pub mod state;
pub mod upstream;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use manager::SessionManager;
pub use registry::StartOutcome;
pub use session::{SessionContext, SessionTiming};
pub use state::SessionState;
