//! Storage seam used by the session layer.
//!
//! `DbStore` is backed by the `registrations` table. `MemoryStore` (behind the
//! `mock` feature) keeps records in memory for tests.

use crate::error::Error;
use crate::registration::{self, RegistrationFields};
use async_trait::async_trait;
use entity::registrations::Model;
use entity::RegistrationKey;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Creates or renews the registration for `key`, resetting `last_renewed_at`.
    async fn upsert(&self, key: &RegistrationKey, fields: RegistrationFields)
        -> Result<Model, Error>;

    async fn find(&self, key: &RegistrationKey) -> Result<Option<Model>, Error>;

    /// Removes the registration. Destroying an absent registration succeeds.
    async fn destroy(&self, key: &RegistrationKey) -> Result<(), Error>;

    async fn list_all(&self) -> Result<Vec<Model>, Error>;
}

pub struct DbStore {
    db: Arc<DatabaseConnection>,
}

impl DbStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RegistrationStore for DbStore {
    async fn upsert(
        &self,
        key: &RegistrationKey,
        fields: RegistrationFields,
    ) -> Result<Model, Error> {
        registration::upsert(&self.db, key, fields).await
    }

    async fn find(&self, key: &RegistrationKey) -> Result<Option<Model>, Error> {
        registration::find_by_key(&self.db, key).await
    }

    async fn destroy(&self, key: &RegistrationKey) -> Result<(), Error> {
        registration::delete_by_key(&self.db, key).await
    }

    async fn list_all(&self) -> Result<Vec<Model>, Error> {
        registration::find_all(&self.db).await
    }
}

#[cfg(feature = "mock")]
pub use memory::MemoryStore;

#[cfg(feature = "mock")]
mod memory {
    use super::*;
    use crate::error::EntityApiErrorKind;
    use dashmap::DashMap;
    use entity::Id;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory `RegistrationStore` with switches for simulating store failures.
    #[derive(Default)]
    pub struct MemoryStore {
        records: DashMap<RegistrationKey, Model>,
        fail_destroy: AtomicBool,
        fail_find: AtomicBool,
        destroy_calls: AtomicUsize,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Stores `model` as-is, bypassing the upsert timestamp reset.
        pub fn insert(&self, model: Model) {
            self.records.insert(model.key(), model);
        }

        pub fn get(&self, key: &RegistrationKey) -> Option<Model> {
            self.records.get(key).map(|entry| entry.value().clone())
        }

        pub fn contains(&self, key: &RegistrationKey) -> bool {
            self.records.contains_key(key)
        }

        pub fn len(&self) -> usize {
            self.records.len()
        }

        pub fn is_empty(&self) -> bool {
            self.records.is_empty()
        }

        pub fn destroy_calls(&self) -> usize {
            self.destroy_calls.load(Ordering::SeqCst)
        }

        pub fn fail_destroys(&self, fail: bool) {
            self.fail_destroy.store(fail, Ordering::SeqCst);
        }

        pub fn fail_finds(&self, fail: bool) {
            self.fail_find.store(fail, Ordering::SeqCst);
        }

        fn simulated_failure() -> Error {
            Error {
                source: None,
                error_kind: EntityApiErrorKind::SystemError,
            }
        }
    }

    #[async_trait]
    impl RegistrationStore for MemoryStore {
        async fn upsert(
            &self,
            key: &RegistrationKey,
            fields: RegistrationFields,
        ) -> Result<Model, Error> {
            let now = chrono::Utc::now();
            let model = match self.records.get(key) {
                Some(existing) => Model {
                    access_token: fields.access_token,
                    app_secret: fields.app_secret,
                    callback_url: fields.callback_url,
                    last_renewed_at: now.into(),
                    updated_at: now.into(),
                    ..existing.value().clone()
                },
                None => Model {
                    id: Id::new_v4(),
                    instance_url: key.instance_url().to_string(),
                    app_id: key.app_id().to_string(),
                    tag: key.tag().to_string(),
                    access_token: fields.access_token,
                    app_secret: fields.app_secret,
                    callback_url: fields.callback_url,
                    last_renewed_at: now.into(),
                    created_at: now.into(),
                    updated_at: now.into(),
                },
            };
            self.records.insert(key.clone(), model.clone());
            Ok(model)
        }

        async fn find(&self, key: &RegistrationKey) -> Result<Option<Model>, Error> {
            if self.fail_find.load(Ordering::SeqCst) {
                return Err(Self::simulated_failure());
            }
            Ok(self.get(key))
        }

        async fn destroy(&self, key: &RegistrationKey) -> Result<(), Error> {
            self.destroy_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_destroy.load(Ordering::SeqCst) {
                return Err(Self::simulated_failure());
            }
            self.records.remove(key);
            Ok(())
        }

        async fn list_all(&self) -> Result<Vec<Model>, Error> {
            Ok(self
                .records
                .iter()
                .map(|entry| entry.value().clone())
                .collect())
        }
    }

}
