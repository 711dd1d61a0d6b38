//! The per-registration session task.
//!
//! A `Session` is owned by exactly one spawned task. It validates its
//! registration, then cycles through connect, stream and backoff until a
//! terminal condition is reached or its cancellation token fires.

use crate::state::{transition, Disconnect, SessionState, Termination, Trigger};
use crate::upstream::{Connector, UpstreamFrame, UpstreamSocket};
use crate::validator::Validator;
use chrono::{DateTime, Utc};
use entity_api::registrations::Model as Registration;
use entity_api::store::RegistrationStore;
use entity_api::RegistrationKey;
use events::{EventPublisher, NotificationEvent, StreamEnvelope};
use log::*;
use service::config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Timers driving every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// Time between pings on an open socket
    pub heartbeat_interval: Duration,
    /// Fixed wait before every reconnect attempt
    pub reconnect_delay: Duration,
    /// Minimum time between two reads of the registration while open
    pub expiry_check_interval: Duration,
    /// A registration not renewed within this window expires
    pub renewal_window: Duration,
    /// Notifications a session buffers for its callback before dropping the oldest
    pub delivery_queue_capacity: usize,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            expiry_check_interval: Duration::from_secs(24 * 60 * 60),
            renewal_window: Duration::from_secs(3 * 24 * 60 * 60),
            delivery_queue_capacity: 1024,
        }
    }
}

impl From<&Config> for SessionTiming {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            reconnect_delay: config.reconnect_delay(),
            expiry_check_interval: config.expiry_check_interval(),
            renewal_window: config.renewal_window(),
            delivery_queue_capacity: config.delivery_queue_capacity,
        }
    }
}

/// Collaborators shared by every session.
pub struct SessionContext {
    pub validator: Validator,
    pub connector: Arc<dyn Connector>,
    pub store: Arc<dyn RegistrationStore>,
    pub publisher: EventPublisher,
    pub timing: SessionTiming,
}

pub(crate) struct Session {
    registration: Registration,
    key: RegistrationKey,
    context: Arc<SessionContext>,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    last_expiry_check: Instant,
}

impl Session {
    pub(crate) fn new(
        registration: Registration,
        context: Arc<SessionContext>,
        cancel: CancellationToken,
        state: watch::Sender<SessionState>,
    ) -> Self {
        Self {
            key: registration.key(),
            registration,
            context,
            cancel,
            state,
            last_expiry_check: Instant::now(),
        }
    }

    pub(crate) fn key(&self) -> &RegistrationKey {
        &self.key
    }

    pub(crate) fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Drives the session until it terminates and reports how it ended.
    pub(crate) async fn run(mut self) -> Termination {
        if let Err(rejection) = self.context.validator.validate(&self.registration) {
            warn!("Rejecting session {}: {rejection}", self.key);
            self.advance(Trigger::Rejected);
            return Termination::Rejected(rejection);
        }
        self.advance(Trigger::Start);

        let capacity = self.context.timing.delivery_queue_capacity.max(1);
        let (queue, deliveries) = broadcast::channel(capacity);
        tokio::spawn(deliver_in_order(
            self.key.clone(),
            self.context.publisher.clone(),
            deliveries,
            self.cancel.clone(),
        ));

        let termination = self.connect_loop(&queue).await;
        info!("Session {} terminated: {termination}", self.key);
        termination
    }

    async fn connect_loop(&mut self, queue: &broadcast::Sender<NotificationEvent>) -> Termination {
        loop {
            // Rebuilt per attempt: an expiry check may have swapped in a renewed token.
            let url = self.context.validator.streaming_url(&self.registration);
            debug!("Connecting session {}", self.key);
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = self.context.connector.connect(&url) => Some(result),
            };

            match connected {
                None => {
                    self.advance(Trigger::Stop);
                    return Termination::Stopped;
                }
                Some(Ok(socket)) => {
                    info!("Session {} connected", self.key);
                    self.advance(Trigger::Connected);
                    self.last_expiry_check = Instant::now();

                    let cause = self.stream(socket, queue).await;
                    if let Some(termination) = cause.termination() {
                        return termination;
                    }
                    warn!("Session {} lost its socket ({cause}), reconnecting", self.key);
                }
                Some(Err(e)) => {
                    warn!("Session {} failed to connect: {e}", self.key);
                    self.advance(Trigger::ConnectFailed);
                }
            }

            if !self.backoff().await {
                return Termination::Stopped;
            }
        }
    }

    /// Waits out the reconnect delay. Returns false when cancelled meanwhile.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.advance(Trigger::Stop);
                false
            }
            _ = tokio::time::sleep(self.context.timing.reconnect_delay) => {
                self.advance(Trigger::BackoffElapsed);
                true
            }
        }
    }

    /// Reads the open socket until it has to be given up, then closes it.
    async fn stream(
        &mut self,
        mut socket: Box<dyn UpstreamSocket>,
        queue: &broadcast::Sender<NotificationEvent>,
    ) -> Disconnect {
        let period = self.context.timing.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let cause = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Disconnect::Stopped,
                _ = heartbeat.tick() => {
                    if let Err(e) = socket.ping().await {
                        warn!("Session {} heartbeat failed: {e}", self.key);
                        break Disconnect::Error;
                    }
                    if let Some(cause) = self.check_expiry().await {
                        break cause;
                    }
                }
                frame = socket.next_frame() => match frame {
                    Some(Ok(UpstreamFrame::Text(text))) => self.forward(&text, queue),
                    Some(Ok(UpstreamFrame::Close(code))) => break Disconnect::Closed(code),
                    Some(Err(e)) => {
                        warn!("Session {} socket error: {e}", self.key);
                        break Disconnect::Error;
                    }
                    None => break Disconnect::Closed(None),
                },
            }
        };

        self.advance(Trigger::Disconnected(cause));
        socket.close().await;
        self.advance(Trigger::SocketReleased(cause));
        cause
    }

    /// Re-reads the registration once the check interval has passed.
    ///
    /// A store error skips this check; the next heartbeat tries again.
    async fn check_expiry(&mut self) -> Option<Disconnect> {
        if self.last_expiry_check.elapsed() < self.context.timing.expiry_check_interval {
            return None;
        }

        let current = match self.context.store.find(&self.key).await {
            Ok(current) => current,
            Err(e) => {
                error!("Session {} could not read its registration: {e}", self.key);
                return None;
            }
        };
        self.last_expiry_check = Instant::now();

        match current {
            None => {
                info!("Registration {} no longer exists", self.key);
                Some(Disconnect::Unregistered)
            }
            Some(registration)
                if is_expired(&registration, Utc::now(), self.context.timing.renewal_window) =>
            {
                info!(
                    "Registration {} expired, last renewed at {}",
                    self.key, registration.last_renewed_at
                );
                Some(Disconnect::Expired)
            }
            Some(registration) => {
                // Renewals may carry a new token or callback URL.
                self.registration = registration;
                None
            }
        }
    }

    fn forward(&self, text: &str, queue: &broadcast::Sender<NotificationEvent>) {
        let envelope = match StreamEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Session {} dropping unparseable frame: {e}", self.key);
                return;
            }
        };

        if !envelope.is_notification() {
            trace!("Session {} ignoring {} event", self.key, envelope.event);
            return;
        }

        let event = NotificationEvent {
            instance_url: self.registration.instance_url.clone(),
            app_id: self.registration.app_id.clone(),
            tag: self.registration.tag.clone(),
            callback_url: self.registration.callback_url.clone(),
            payload: envelope.payload,
        };
        if queue.send(event).is_err() {
            warn!("Session {} delivery queue closed, dropping notification", self.key);
        }
    }

    fn advance(&self, trigger: Trigger) {
        let from = *self.state.borrow();
        match transition(from, trigger) {
            Some(to) => {
                debug!("Session {}: {from} -> {to}", self.key);
                self.state.send_replace(to);
            }
            None => warn!("Session {}: {trigger:?} ignored in state {from}", self.key),
        }
    }
}

/// Publishes queued notifications one at a time so a session's events reach
/// handlers in the order they were received.
///
/// The queue is bounded. When a slow callback lets it fill up, the oldest
/// notifications are overwritten and the loss is logged.
async fn deliver_in_order(
    key: RegistrationKey,
    publisher: EventPublisher,
    mut deliveries: broadcast::Receiver<NotificationEvent>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = deliveries.recv() => received,
        };
        match received {
            Ok(event) => publisher.publish(event).await,
            Err(RecvError::Lagged(dropped)) => {
                warn!("Session {key} delivery queue full, dropped {dropped} oldest notifications")
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// True when `registration` was last renewed `window` or longer before `now`.
pub fn is_expired(registration: &Registration, now: DateTime<Utc>, window: Duration) -> bool {
    now.signed_duration_since(registration.last_renewed_at)
        .to_std()
        .map(|elapsed| elapsed >= window)
        .unwrap_or(false)
}
