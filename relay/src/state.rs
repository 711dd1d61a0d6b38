use crate::validator::Rejection;
use std::fmt;

/// WebSocket close code for a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, registration not validated yet
    Idle,
    /// Upstream handshake in progress
    Connecting,
    /// Socket open, heartbeat running
    Open,
    /// Waiting out the reconnect delay
    Reconnecting,
    /// Socket being torn down; resolves to `Reconnecting` or `Terminated`
    Closing,
    Terminated,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminated)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Open => write!(f, "open"),
            SessionState::Reconnecting => write!(f, "reconnecting"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Why an open socket is being given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Transport error while reading or pinging
    Error,
    /// Close frame from upstream (`None` when the stream ended without one)
    Closed(Option<u16>),
    /// Registration not renewed within the renewal window
    Expired,
    /// Registration no longer in the store
    Unregistered,
    /// Session cancelled locally
    Stopped,
}

impl Disconnect {
    /// How the session ends after this disconnect, or `None` when it reconnects.
    pub fn termination(&self) -> Option<Termination> {
        match self {
            Disconnect::Error => None,
            Disconnect::Closed(Some(NORMAL_CLOSURE)) => Some(Termination::ClosedByServer),
            Disconnect::Closed(_) => None,
            Disconnect::Expired => Some(Termination::Expired),
            Disconnect::Unregistered => Some(Termination::Unregistered),
            Disconnect::Stopped => Some(Termination::Stopped),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.termination().is_none()
    }
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Disconnect::Error => write!(f, "socket error"),
            Disconnect::Closed(Some(code)) => write!(f, "closed with code {code}"),
            Disconnect::Closed(None) => write!(f, "closed without status"),
            Disconnect::Expired => write!(f, "registration expired"),
            Disconnect::Unregistered => write!(f, "registration removed"),
            Disconnect::Stopped => write!(f, "stopped"),
        }
    }
}

/// Final outcome of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Rejected(Rejection),
    ClosedByServer,
    Expired,
    Unregistered,
    /// Cancelled by the registry; whoever cancelled owns the registration's fate.
    Stopped,
}

impl Termination {
    pub fn destroys_registration(&self) -> bool {
        !matches!(self, Termination::Stopped)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Termination::Rejected(rejection) => write!(f, "rejected: {rejection}"),
            Termination::ClosedByServer => write!(f, "closed by server"),
            Termination::Expired => write!(f, "expired"),
            Termination::Unregistered => write!(f, "unregistered"),
            Termination::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Registration validated
    Start,
    /// Registration failed validation
    Rejected,
    Connected,
    ConnectFailed,
    Disconnected(Disconnect),
    /// Socket closed after a disconnect
    SocketReleased(Disconnect),
    BackoffElapsed,
    Stop,
}

/// Next state for `trigger` in state `from`, or `None` if the trigger does not apply.
pub fn transition(from: SessionState, trigger: Trigger) -> Option<SessionState> {
    use SessionState::*;

    match (from, trigger) {
        (Terminated, _) => None,
        (Idle, Trigger::Start) => Some(Connecting),
        (Idle, Trigger::Rejected) => Some(Terminated),
        (Connecting, Trigger::Connected) => Some(Open),
        (Connecting, Trigger::ConnectFailed) => Some(Reconnecting),
        (Open, Trigger::Disconnected(_)) => Some(Closing),
        (Closing, Trigger::SocketReleased(cause)) if cause.is_retryable() => Some(Reconnecting),
        (Closing, Trigger::SocketReleased(_)) => Some(Terminated),
        (Reconnecting, Trigger::BackoffElapsed) => Some(Connecting),
        (_, Trigger::Stop) => Some(Terminated),
        _ => None,
    }
}
