//! SeaORM Entity for the registrations table.
//! One row per subscription, unique on (instance_url, app_id, tag).

use crate::registration_key::RegistrationKey;
use crate::Id;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "registrations")]
pub struct Model {
    #[serde(skip_deserializing)]
    #[sea_orm(primary_key)]
    pub id: Id,

    /// Public URL of the upstream instance, always stored lowercased.
    pub instance_url: String,
    pub app_id: String,
    pub tag: String,

    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub app_secret: String,

    pub callback_url: String,

    /// Reset to now every time the owning client registers again.
    pub last_renewed_at: DateTimeWithTimeZone,

    #[serde(skip_deserializing)]
    pub created_at: DateTimeWithTimeZone,
    #[serde(skip_deserializing)]
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn key(&self) -> RegistrationKey {
        RegistrationKey::new(&self.instance_url, &self.app_id, &self.tag)
    }
}
