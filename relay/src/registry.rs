use crate::error::Error;
use crate::session::{Session, SessionContext};
use crate::state::{SessionState, Termination};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use entity_api::registration::RegistrationFields;
use entity_api::registrations::Model as Registration;
use entity_api::RegistrationKey;
use futures::future::join_all;
use log::*;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Tells apart successive sessions started under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyActive,
}

/// Registry side of a running session.
pub struct SessionHandle {
    id: SessionId,
    cancel: CancellationToken,
    /// Fired once the task has finished its own cleanup
    cleaned_up: CancellationToken,
    /// Set when the task saves its registration again after a predecessor
    resaves_registration: bool,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<Termination>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Cancels the session and waits for its task to finish.
    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Session {} task failed: {e}", self.id);
        }
    }
}

/// Concurrency-safe map from registration key to its session.
pub struct SessionRegistry {
    sessions: Arc<DashMap<RegistrationKey, SessionHandle>>,
    context: Arc<SessionContext>,
}

impl SessionRegistry {
    pub fn new(context: Arc<SessionContext>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            context,
        }
    }

    /// Starts a session for `registration` unless one is already live for its key.
    ///
    /// The handle is inserted while the map entry is still locked, so two
    /// concurrent calls for the same key can never both start a session.
    pub fn start_session(&self, registration: Registration) -> StartOutcome {
        match self.sessions.entry(registration.key()) {
            Entry::Occupied(mut entry) if entry.get().state().is_terminal() => {
                info!("Restarting terminated session for {}", entry.key());
                // Ends a predecessor still retrying its destroy.
                entry.get().cancel.cancel();
                let predecessor = entry.get().cleaned_up.clone();
                let handle = self.spawn(registration, Some(predecessor));
                entry.insert(handle);
                StartOutcome::Started
            }
            Entry::Occupied(entry) => {
                debug!(
                    "Session for {} is already {}",
                    entry.key(),
                    entry.get().state()
                );
                StartOutcome::AlreadyActive
            }
            Entry::Vacant(entry) => {
                info!("Starting session for {}", entry.key());
                let handle = self.spawn(registration, None);
                entry.insert(handle);
                StartOutcome::Started
            }
        }
    }

    /// Destroys the registration for `key` and stops its session.
    ///
    /// Returns `Ok(false)` without touching the store when no session is
    /// registered for `key`. When the store fails the session is left running
    /// so the call can be retried.
    pub async fn stop_session(&self, key: &RegistrationKey) -> Result<bool, Error> {
        let Some(id) = self.sessions.get(key).map(|handle| handle.id) else {
            debug!("No session to stop for {key}");
            return Ok(false);
        };

        self.context.store.destroy(key).await.map_err(|e| {
            warn!("Could not destroy registration {key}, keeping its session: {e}");
            Error::from(e)
        })?;

        match self.sessions.remove_if(key, |_, handle| handle.id == id) {
            Some((_, handle)) => {
                info!("Stopping session for {key}");
                let resaved = handle.resaves_registration;
                handle.shutdown().await;
                if resaved {
                    // The task may have saved the registration again after the
                    // destroy above.
                    self.context.store.destroy(key).await?;
                }
                Ok(true)
            }
            // Ended on its own while the registration was being destroyed.
            None => Ok(false),
        }
    }

    /// Stops every session without destroying registrations.
    pub async fn shutdown(&self) {
        let keys: Vec<RegistrationKey> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let handles: Vec<SessionHandle> = keys
            .iter()
            .filter_map(|key| self.sessions.remove(key).map(|(_, handle)| handle))
            .collect();

        info!("Shutting down {} sessions", handles.len());
        join_all(handles.into_iter().map(SessionHandle::shutdown)).await;
    }

    pub fn state(&self, key: &RegistrationKey) -> Option<SessionState> {
        self.sessions.get(key).map(|handle| handle.state())
    }

    pub fn contains(&self, key: &RegistrationKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn keys(&self) -> Vec<RegistrationKey> {
        self.sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn spawn(
        &self,
        registration: Registration,
        predecessor: Option<CancellationToken>,
    ) -> SessionHandle {
        let id = SessionId::generate();
        let cancel = CancellationToken::new();
        let cleaned_up = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let session = Session::new(
            registration,
            self.context.clone(),
            cancel.clone(),
            state_tx,
        );
        let resaves_registration = predecessor.is_some();
        let task = tokio::spawn(supervise(
            session,
            id,
            predecessor,
            cancel.clone(),
            cleaned_up.clone(),
            self.sessions.clone(),
            self.context.clone(),
        ));

        SessionHandle {
            id,
            cancel,
            cleaned_up,
            resaves_registration,
            state: state_rx,
            task,
        }
    }
}

/// Runs a session and cleans up after it ends on its own: destroys the
/// registration when the termination calls for it, then removes the session's
/// own registry entry.
async fn supervise(
    session: Session,
    id: SessionId,
    predecessor: Option<CancellationToken>,
    cancel: CancellationToken,
    cleaned_up: CancellationToken,
    sessions: Arc<DashMap<RegistrationKey, SessionHandle>>,
    context: Arc<SessionContext>,
) -> Termination {
    let key = session.key().clone();

    if let Some(predecessor) = predecessor {
        // The previous session for this key may be destroying the registration
        // this session was started for.
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = predecessor.cancelled() => {}
        }
        if cancel.is_cancelled() {
            debug!("Session for {key} stopped before its registration was saved again");
        } else {
            let registration = session.registration();
            let fields = RegistrationFields {
                access_token: registration.access_token.clone(),
                app_secret: registration.app_secret.clone(),
                callback_url: registration.callback_url.clone(),
            };
            if let Err(e) = context.store.upsert(&key, fields).await {
                error!("Could not re-save registration {key} after its previous session: {e}");
            }
        }
    }

    let termination = session.run().await;

    if termination.destroys_registration() {
        destroy_registration(&key, termination, &cancel, &context).await;
    }

    sessions.remove_if(&key, |_, handle| handle.id == id);
    cleaned_up.cancel();
    termination
}

/// Destroys the registration of a session that terminated on its own.
///
/// A failed destroy is retried after the reconnect delay. The terminated entry
/// stays in the registry meanwhile, until the destroy succeeds or the entry is
/// stopped or replaced.
async fn destroy_registration(
    key: &RegistrationKey,
    termination: Termination,
    cancel: &CancellationToken,
    context: &SessionContext,
) {
    loop {
        match context.store.destroy(key).await {
            Ok(()) => return,
            Err(e) => error!("Could not destroy registration {key} after {termination}: {e}"),
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Giving up destroying registration {key}, its session was stopped or replaced");
                return;
            }
            _ = tokio::time::sleep(context.timing.reconnect_delay) => {
                debug!("Retrying destroy of registration {key}");
            }
        }
    }
}
