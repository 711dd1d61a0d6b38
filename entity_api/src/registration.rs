use super::error::Error;
use entity::registrations::{ActiveModel, Column, Entity, Model};
use entity::{Id, RegistrationKey};
use log::debug;
use sea_orm::{
    entity::prelude::*,
    ActiveValue::{Set, Unchanged},
    DatabaseConnection, TryIntoModel,
};

/// Mutable part of a registration supplied by the client on every register call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationFields {
    pub access_token: String,
    pub app_secret: String,
    pub callback_url: String,
}

/// Creates the registration for `key`, or renews the existing one.
///
/// Either way `last_renewed_at` is reset to now.
pub async fn upsert(
    db: &DatabaseConnection,
    key: &RegistrationKey,
    fields: RegistrationFields,
) -> Result<Model, Error> {
    let now = chrono::Utc::now();

    match find_by_key(db, key).await? {
        Some(existing) => {
            debug!("Renewing registration {key}");

            let active_model = ActiveModel {
                id: Unchanged(existing.id),
                instance_url: Unchanged(existing.instance_url),
                app_id: Unchanged(existing.app_id),
                tag: Unchanged(existing.tag),
                access_token: Set(fields.access_token),
                app_secret: Set(fields.app_secret),
                callback_url: Set(fields.callback_url),
                last_renewed_at: Set(now.into()),
                created_at: Unchanged(existing.created_at),
                updated_at: Set(now.into()),
            };

            Ok(active_model.update(db).await?.try_into_model()?)
        }
        None => {
            debug!("Creating registration {key}");

            let active_model = ActiveModel {
                id: Set(Id::new_v4()),
                instance_url: Set(key.instance_url().to_string()),
                app_id: Set(key.app_id().to_string()),
                tag: Set(key.tag().to_string()),
                access_token: Set(fields.access_token),
                app_secret: Set(fields.app_secret),
                callback_url: Set(fields.callback_url),
                last_renewed_at: Set(now.into()),
                created_at: Set(now.into()),
                updated_at: Set(now.into()),
            };

            Ok(active_model.insert(db).await?.try_into_model()?)
        }
    }
}

/// Finds a registration by its (instance_url, app_id, tag) key
pub async fn find_by_key(
    db: &DatabaseConnection,
    key: &RegistrationKey,
) -> Result<Option<Model>, Error> {
    Ok(Entity::find()
        .filter(Column::InstanceUrl.eq(key.instance_url()))
        .filter(Column::AppId.eq(key.app_id()))
        .filter(Column::Tag.eq(key.tag()))
        .one(db)
        .await?)
}

/// Deletes the registration for `key`. Deleting an absent registration is not an error.
pub async fn delete_by_key(db: &DatabaseConnection, key: &RegistrationKey) -> Result<(), Error> {
    let result = Entity::delete_many()
        .filter(Column::InstanceUrl.eq(key.instance_url()))
        .filter(Column::AppId.eq(key.app_id()))
        .filter(Column::Tag.eq(key.tag()))
        .exec(db)
        .await?;

    debug!(
        "Deleted registration {key} ({} row(s) affected)",
        result.rows_affected
    );

    Ok(())
}

/// Returns every stored registration
pub async fn find_all(db: &DatabaseConnection) -> Result<Vec<Model>, Error> {
    Ok(Entity::find().all(db).await?)
}
