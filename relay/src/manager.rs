use crate::error::Error;
use crate::registry::{SessionRegistry, StartOutcome};
use crate::session::SessionContext;
use crate::state::SessionState;
use entity_api::registrations::Model as Registration;
use entity_api::store::RegistrationStore;
use entity_api::RegistrationKey;
use log::*;
use std::sync::Arc;

/// Entry point used by the registration layer.
///
/// Starting returns as soon as the session is registered; how the session
/// fares afterwards is only reported through logs.
pub struct SessionManager {
    registry: SessionRegistry,
    store: Arc<dyn RegistrationStore>,
}

impl SessionManager {
    pub fn new(context: SessionContext) -> Self {
        let store = context.store.clone();
        Self {
            registry: SessionRegistry::new(Arc::new(context)),
            store,
        }
    }

    pub fn start(&self, registration: Registration) -> StartOutcome {
        self.registry.start_session(registration)
    }

    /// Stops the session for `key` and destroys its registration.
    ///
    /// The registration is destroyed even when no session is live, so repeated
    /// calls all succeed once the store is reachable.
    pub async fn stop(&self, key: &RegistrationKey) -> Result<(), Error> {
        if !self.registry.stop_session(key).await? {
            self.store.destroy(key).await?;
        }
        Ok(())
    }

    /// Starts a session for every stored registration. Returns how many were started.
    pub async fn restore(&self) -> Result<usize, Error> {
        let registrations = self.store.list_all().await?;
        let total = registrations.len();

        let started = registrations
            .into_iter()
            .map(|registration| self.start(registration))
            .filter(|outcome| *outcome == StartOutcome::Started)
            .count();

        info!("Restored {started} of {total} stored registrations");
        Ok(started)
    }

    /// Stops every session, keeping registrations for the next restore.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    pub fn state(&self, key: &RegistrationKey) -> Option<SessionState> {
        self.registry.state(key)
    }

    pub fn active_sessions(&self) -> Vec<RegistrationKey> {
        self.registry.keys()
    }

    pub fn store(&self) -> Arc<dyn RegistrationStore> {
        self.store.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NORMAL_CLOSURE;
    use crate::testing::{self, FakeConnector, RecordingHandler};
    use chrono::Utc;
    use entity_api::registration::RegistrationFields;
    use entity_api::store::{MemoryStore, RegistrationStore};
    use events::EventPublisher;
    use serde_json::json;
    use std::time::Duration;

    fn manager(connector: &FakeConnector, store: &Arc<MemoryStore>) -> SessionManager {
        SessionManager::new(testing::session_context(
            connector.clone(),
            store.clone(),
            EventPublisher::new(),
            testing::timing(),
        ))
    }

    fn stored(store: &MemoryStore, instance_url: &str, token: &str) -> Registration {
        let registration = testing::registration(instance_url, token);
        store.insert(registration.clone());
        registration
    }

    #[tokio::test]
    async fn start_connects_to_the_user_stream() {
        let connector = FakeConnector::new();
        let _remote = connector.accept_next();
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&connector, &store);
        let registration = stored(&store, "https://example.social", "abc123");

        assert_eq!(manager.start(registration.clone()), StartOutcome::Started);
        testing::wait_until(|| manager.state(&registration.key()) == Some(SessionState::Open))
            .await;

        assert_eq!(
            connector.urls(),
            vec!["https://example.social/api/v1/streaming/?access_token=abc123&stream=user"]
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_registration_is_destroyed_without_connecting() {
        let connector = FakeConnector::new();
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&connector, &store);
        let registration = stored(&store, "https://example.social", "abc&stream=public");
        let key = registration.key();

        assert_eq!(manager.start(registration), StartOutcome::Started);

        testing::wait_until(|| !store.contains(&key)).await;
        testing::wait_until(|| manager.state(&key).is_none()).await;
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn unknown_app_is_rejected() {
        let connector = FakeConnector::new();
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&connector, &store);
        let mut registration = testing::registration("https://example.social", "abc123");
        registration.app_secret = "wrong".to_string();
        store.insert(registration.clone());

        manager.start(registration.clone());

        testing::wait_until(|| !store.contains(&registration.key())).await;
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn normal_close_destroys_registration() {
        let connector = FakeConnector::new();
        let remote = connector.accept_next();
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&connector, &store);
        let registration = stored(&store, "https://example.social", "abc123");
        let key = registration.key();

        manager.start(registration);
        testing::wait_until(|| manager.state(&key) == Some(SessionState::Open)).await;
        remote.close(Some(NORMAL_CLOSURE));

        testing::wait_until(|| manager.state(&key).is_none()).await;
        testing::wait_until(|| !store.contains(&key)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn abnormal_close_reconnects_and_keeps_registration() {
        let connector = FakeConnector::new();
        let first = connector.accept_next();
        let _second = connector.accept_next();
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&connector, &store);
        let registration = stored(&store, "https://example.social", "abc123");
        let key = registration.key();

        manager.start(registration);
        testing::wait_until(|| manager.state(&key) == Some(SessionState::Open)).await;
        first.close(Some(1006));

        testing::wait_until(|| connector.attempts() == 2).await;
        testing::wait_until(|| manager.state(&key) == Some(SessionState::Open)).await;
        assert!(store.contains(&key));
        assert_eq!(store.destroy_calls(), 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_socket_errors_never_destroy_the_registration() {
        let connector = FakeConnector::new();
        let remotes: Vec<_> = (0..3).map(|_| connector.accept_next()).collect();
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&connector, &store);
        let registration = stored(&store, "https://example.social", "abc123");
        let key = registration.key();

        manager.start(registration);
        for (attempt, remote) in remotes.iter().enumerate() {
            testing::wait_until(|| connector.attempts() == attempt + 1).await;
            testing::wait_until(|| manager.state(&key) == Some(SessionState::Open)).await;
            remote.fail();
        }

        // Queue exhausted: further connects are refused and retried.
        testing::wait_until(|| connector.attempts() >= 5).await;
        assert_eq!(store.destroy_calls(), 0);
        assert!(manager.state(&key).is_some());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn only_notifications_are_published_in_order() {
        let connector = FakeConnector::new();
        let remote = connector.accept_next();
        let store = Arc::new(MemoryStore::new());
        let handler = RecordingHandler::new();
        let manager = SessionManager::new(testing::session_context(
            connector.clone(),
            store.clone(),
            EventPublisher::new().with_handler(handler.clone()),
            testing::timing(),
        ));
        let registration = stored(&store, "https://example.social", "abc123");
        let key = registration.key();

        manager.start(registration);
        testing::wait_until(|| manager.state(&key) == Some(SessionState::Open)).await;

        remote.send_json(json!({"event": "update", "payload": {"id": 1}}));
        remote.send_json(json!({"event": "notification", "payload": {"id": 42}}));
        remote.send_text("not json");
        remote.send_json(json!({"event": "delete", "payload": "7"}));
        remote.send_json(json!({"event": "notification", "payload": {"id": 43}}));

        testing::wait_until(|| handler.events().len() == 2).await;
        let events = handler.events();
        assert_eq!(events[0].payload, json!({"id": 42}));
        assert_eq!(events[1].payload, json!({"id": 43}));
        assert_eq!(events[0].instance_url, "https://example.social");
        assert_eq!(events[0].app_id, "app1");
        assert_eq!(events[0].tag, "t1");
        assert_eq!(events[0].callback_url, "https://client/cb");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_pings_the_open_socket() {
        let connector = FakeConnector::new();
        let remote = connector.accept_next();
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&connector, &store);
        let registration = stored(&store, "https://example.social", "abc123");

        manager.start(registration);
        testing::wait_until(|| remote.pings() >= 2).await;

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stale_registration_expires_on_heartbeat() {
        let connector = FakeConnector::new();
        let remote = connector.accept_next();
        let store = Arc::new(MemoryStore::new());
        let mut timing = testing::timing();
        timing.expiry_check_interval = Duration::ZERO;
        let manager = SessionManager::new(testing::session_context(
            connector.clone(),
            store.clone(),
            EventPublisher::new(),
            timing,
        ));
        let mut registration = testing::registration("https://example.social", "abc123");
        registration.last_renewed_at =
            (Utc::now() - chrono::Duration::days(3) - chrono::Duration::minutes(1)).into();
        store.insert(registration.clone());
        let key = registration.key();

        manager.start(registration);

        testing::wait_until(|| manager.state(&key).is_none()).await;
        testing::wait_until(|| !store.contains(&key)).await;
        assert!(remote.is_closed());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn reconnect_uses_the_token_from_the_latest_renewal() {
        let connector = FakeConnector::new();
        let first = connector.accept_next();
        let _second = connector.accept_next();
        let store = Arc::new(MemoryStore::new());
        let mut timing = testing::timing();
        timing.expiry_check_interval = Duration::ZERO;
        let manager = SessionManager::new(testing::session_context(
            connector.clone(),
            store.clone(),
            EventPublisher::new(),
            timing,
        ));
        let registration = stored(&store, "https://example.social", "abc123");
        let key = registration.key();

        manager.start(registration);
        testing::wait_until(|| manager.state(&key) == Some(SessionState::Open)).await;

        store
            .upsert(
                &key,
                RegistrationFields {
                    access_token: "new456".to_string(),
                    app_secret: "secret".to_string(),
                    callback_url: "https://client/cb".to_string(),
                },
            )
            .await
            .unwrap();
        // A ping after the renewal is followed by an expiry check, which is
        // done by the time the next ping goes out.
        let pings = first.pings();
        testing::wait_until(|| first.pings() >= pings + 2).await;

        first.close(Some(1006));
        testing::wait_until(|| connector.attempts() == 2).await;
        testing::wait_until(|| manager.state(&key) == Some(SessionState::Open)).await;

        let urls = connector.urls();
        assert!(urls[0].contains("access_token=abc123"));
        assert!(urls[1].contains("access_token=new456"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn recently_renewed_registration_stays_open() {
        let connector = FakeConnector::new();
        let remote = connector.accept_next();
        let store = Arc::new(MemoryStore::new());
        let mut timing = testing::timing();
        timing.expiry_check_interval = Duration::ZERO;
        let manager = SessionManager::new(testing::session_context(
            connector.clone(),
            store.clone(),
            EventPublisher::new(),
            timing,
        ));
        let mut registration = testing::registration("https://example.social", "abc123");
        registration.last_renewed_at = (Utc::now() - chrono::Duration::days(2)).into();
        store.insert(registration.clone());
        let key = registration.key();

        manager.start(registration);
        testing::wait_until(|| remote.pings() >= 3).await;

        assert_eq!(manager.state(&key), Some(SessionState::Open));
        assert!(store.contains(&key));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn expiry_is_not_checked_before_the_interval() {
        let connector = FakeConnector::new();
        let remote = connector.accept_next();
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&connector, &store);
        let mut registration = testing::registration("https://example.social", "abc123");
        registration.last_renewed_at = (Utc::now() - chrono::Duration::days(10)).into();
        store.insert(registration.clone());
        let key = registration.key();

        manager.start(registration);
        testing::wait_until(|| remote.pings() >= 3).await;

        assert_eq!(manager.state(&key), Some(SessionState::Open));
        assert!(store.contains(&key));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn missing_registration_ends_the_session() {
        let connector = FakeConnector::new();
        let remote = connector.accept_next();
        let store = Arc::new(MemoryStore::new());
        let mut timing = testing::timing();
        timing.expiry_check_interval = Duration::ZERO;
        let manager = SessionManager::new(testing::session_context(
            connector.clone(),
            store.clone(),
            EventPublisher::new(),
            timing,
        ));
        // Never stored: the first check finds nothing.
        let registration = testing::registration("https://example.social", "abc123");
        let key = registration.key();

        manager.start(registration);

        testing::wait_until(|| manager.state(&key).is_none()).await;
        assert!(remote.is_closed());
    }

    #[tokio::test]
    async fn store_read_failure_is_retried_on_the_next_tick() {
        let connector = FakeConnector::new();
        let remote = connector.accept_next();
        let store = Arc::new(MemoryStore::new());
        store.fail_finds(true);
        let mut timing = testing::timing();
        timing.expiry_check_interval = Duration::ZERO;
        let manager = SessionManager::new(testing::session_context(
            connector.clone(),
            store.clone(),
            EventPublisher::new(),
            timing,
        ));
        let registration = stored(&store, "https://example.social", "abc123");
        let key = registration.key();

        manager.start(registration);
        testing::wait_until(|| remote.pings() >= 3).await;
        assert_eq!(manager.state(&key), Some(SessionState::Open));

        store.destroy(&key).await.unwrap();
        store.fail_finds(false);
        testing::wait_until(|| manager.state(&key).is_none()).await;
    }

    #[tokio::test]
    async fn stop_without_session_still_destroys_registration() {
        let connector = FakeConnector::new();
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&connector, &store);
        let registration = stored(&store, "https://example.social", "abc123");
        let key = registration.key();

        manager.stop(&key).await.unwrap();
        assert!(!store.contains(&key));

        // Idempotent.
        manager.stop(&key).await.unwrap();
    }

    #[tokio::test]
    async fn stop_surfaces_store_errors() {
        let connector = FakeConnector::new();
        let store = Arc::new(MemoryStore::new());
        store.fail_destroys(true);
        let manager = manager(&connector, &store);
        let registration = stored(&store, "https://example.social", "abc123");

        assert!(manager.stop(&registration.key()).await.is_err());
        assert!(store.contains(&registration.key()));
    }

    #[tokio::test]
    async fn restore_starts_every_stored_registration() {
        let connector = FakeConnector::new();
        let _first = connector.accept_next();
        let _second = connector.accept_next();
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&connector, &store);
        let first = stored(&store, "https://example.social", "abc123");
        let mut second = testing::registration("https://other.social", "def456");
        second.tag = "t2".to_string();
        store.insert(second.clone());

        assert_eq!(manager.restore().await.unwrap(), 2);
        testing::wait_until(|| connector.attempts() == 2).await;

        let mut active = manager.active_sessions();
        active.sort_by(|a, b| a.instance_url().cmp(b.instance_url()));
        assert_eq!(active, vec![first.key(), second.key()]);

        manager.shutdown().await;
        assert!(manager.active_sessions().is_empty());
        assert_eq!(store.len(), 2);
    }
}
