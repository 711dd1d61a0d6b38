//! Test doubles for the upstream transport and helpers shared by the unit tests.

use crate::session::{SessionContext, SessionTiming};
use crate::upstream::{Connector, UpstreamError, UpstreamFrame, UpstreamSocket};
use crate::validator::Validator;
use async_trait::async_trait;
use chrono::Utc;
use entity_api::registrations::Model as Registration;
use entity_api::error::Error as StoreError;
use entity_api::registration::RegistrationFields;
use entity_api::store::{MemoryStore, RegistrationStore};
use entity_api::{Id, RegistrationKey};
use events::{EventHandler, EventPublisher, NotificationEvent};
use serde_json::Value;
use service::tables::{AppTable, InstanceTable};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;

pub(crate) fn registration(instance_url: &str, access_token: &str) -> Registration {
    let now = Utc::now();
    Registration {
        id: Id::new_v4(),
        instance_url: instance_url.to_string(),
        app_id: "app1".to_string(),
        tag: "t1".to_string(),
        access_token: access_token.to_string(),
        app_secret: "secret".to_string(),
        callback_url: "https://client/cb".to_string(),
        last_renewed_at: now.into(),
        created_at: now.into(),
        updated_at: now.into(),
    }
}

pub(crate) fn validator() -> Validator {
    Validator::new(
        AppTable::from_json(r#"{"app1": {"secret": "secret"}}"#).unwrap(),
        InstanceTable::from_json(r#"{"https://example.social": {}, "*": {}}"#).unwrap(),
    )
}

/// Short timers so state changes happen within a few milliseconds.
pub(crate) fn timing() -> SessionTiming {
    SessionTiming {
        heartbeat_interval: Duration::from_millis(20),
        reconnect_delay: Duration::from_millis(20),
        expiry_check_interval: Duration::from_secs(3600),
        ..SessionTiming::default()
    }
}

pub(crate) fn session_context(
    connector: FakeConnector,
    store: Arc<dyn RegistrationStore>,
    publisher: EventPublisher,
    timing: SessionTiming,
) -> SessionContext {
    SessionContext {
        validator: validator(),
        connector: Arc::new(connector),
        store,
        publisher,
        timing,
    }
}

pub(crate) fn context(connector: FakeConnector, store: Arc<dyn RegistrationStore>) -> Arc<SessionContext> {
    context_with_timing(connector, store, timing())
}

pub(crate) fn context_with_timing(
    connector: FakeConnector,
    store: Arc<dyn RegistrationStore>,
    timing: SessionTiming,
) -> Arc<SessionContext> {
    Arc::new(session_context(
        connector,
        store,
        EventPublisher::new(),
        timing,
    ))
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A `MemoryStore` whose destroys can be held back, leaving them in flight
/// until `release_destroys` is called.
pub(crate) struct GatedStore {
    inner: MemoryStore,
    held: AtomicBool,
    waiting: AtomicUsize,
    gate: Semaphore,
}

impl GatedStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            held: AtomicBool::new(false),
            waiting: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        })
    }

    pub(crate) fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    pub(crate) fn hold_destroys(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Destroys currently blocked on the gate.
    pub(crate) fn waiting_destroys(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub(crate) fn release_destroys(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.add_permits(1024);
    }
}

#[async_trait]
impl RegistrationStore for GatedStore {
    async fn upsert(
        &self,
        key: &RegistrationKey,
        fields: RegistrationFields,
    ) -> Result<Registration, StoreError> {
        self.inner.upsert(key, fields).await
    }

    async fn find(&self, key: &RegistrationKey) -> Result<Option<Registration>, StoreError> {
        self.inner.find(key).await
    }

    async fn destroy(&self, key: &RegistrationKey) -> Result<(), StoreError> {
        if self.held.load(Ordering::SeqCst) {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.destroy(key).await
    }

    async fn list_all(&self) -> Result<Vec<Registration>, StoreError> {
        self.inner.list_all().await
    }
}

/// Hands out queued `FakeSocket`s in order. Connects are refused once the
/// queue is empty.
#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    sockets: Arc<Mutex<VecDeque<FakeSocket>>>,
    urls: Arc<Mutex<Vec<String>>>,
    attempts: Arc<AtomicUsize>,
    hang: Arc<AtomicBool>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues a socket for the next successful connect and returns its remote end.
    pub(crate) fn accept_next(&self) -> FakeRemote {
        let (socket, remote) = fake_socket();
        self.sockets.lock().unwrap().push_back(socket);
        remote
    }

    /// Makes every following connect hang until the caller gives up.
    pub(crate) fn hang_connects(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn UpstreamSocket>, UpstreamError> {
        self.urls.lock().unwrap().push(url.to_string());
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let socket = self.sockets.lock().unwrap().pop_front();
        match socket {
            Some(socket) => Ok(Box::new(socket)),
            None => Err(UpstreamError::new("connection refused")),
        }
    }
}

#[derive(Default)]
struct SocketShared {
    pings: AtomicUsize,
    closed: AtomicBool,
}

pub(crate) struct FakeSocket {
    frames: mpsc::UnboundedReceiver<Result<UpstreamFrame, UpstreamError>>,
    shared: Arc<SocketShared>,
}

/// Upstream side of a `FakeSocket`. Dropping it ends the stream.
pub(crate) struct FakeRemote {
    frames: mpsc::UnboundedSender<Result<UpstreamFrame, UpstreamError>>,
    shared: Arc<SocketShared>,
}

fn fake_socket() -> (FakeSocket, FakeRemote) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(SocketShared::default());
    (
        FakeSocket {
            frames: rx,
            shared: shared.clone(),
        },
        FakeRemote { frames: tx, shared },
    )
}

#[async_trait]
impl UpstreamSocket for FakeSocket {
    async fn next_frame(&mut self) -> Option<Result<UpstreamFrame, UpstreamError>> {
        self.frames.recv().await
    }

    async fn ping(&mut self) -> Result<(), UpstreamError> {
        self.shared.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

impl FakeRemote {
    pub(crate) fn send_text(&self, text: &str) {
        let _ = self.frames.send(Ok(UpstreamFrame::Text(text.to_string())));
    }

    pub(crate) fn send_json(&self, value: Value) {
        self.send_text(&value.to_string());
    }

    pub(crate) fn close(&self, code: Option<u16>) {
        let _ = self.frames.send(Ok(UpstreamFrame::Close(code)));
    }

    pub(crate) fn fail(&self) {
        let _ = self.frames.send(Err(UpstreamError::new("connection reset")));
    }

    pub(crate) fn pings(&self) -> usize {
        self.shared.pings.load(Ordering::SeqCst)
    }

    /// True once the session closed its end.
    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct RecordingHandler {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingHandler {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &NotificationEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
