//! Register, unregister and restore, as called by the front door.
//!
//! All three return as soon as the store and the registry have been updated;
//! how the upstream session fares afterwards is only visible in the logs.

use crate::error::Error;
use entity_api::registration::RegistrationFields;
use entity_api::registrations::Model;
use entity_api::store::RegistrationStore;
use entity_api::RegistrationKey;
use log::*;
use relay::{SessionManager, StartOutcome};
use reqwest::Url;
use serde::Deserialize;

/// A client's request to relay notifications for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub instance_url: String,
    pub app_id: String,
    pub tag: String,
    pub access_token: String,
    pub app_secret: String,
    pub callback_url: String,
}

impl RegisterRequest {
    pub fn key(&self) -> RegistrationKey {
        RegistrationKey::new(&self.instance_url, &self.app_id, &self.tag)
    }

    /// Checks the request shape only; app, instance and token are checked by
    /// the session against the configured tables.
    pub fn validate(&self) -> Result<(), Error> {
        let fields = [
            ("instanceUrl", &self.instance_url),
            ("appId", &self.app_id),
            ("tag", &self.tag),
            ("accessToken", &self.access_token),
            ("appSecret", &self.app_secret),
            ("callbackUrl", &self.callback_url),
        ];
        if let Some((name, _)) = fields.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(Error::invalid(format!("{name} must not be empty")));
        }

        let callback = Url::parse(&self.callback_url)
            .map_err(|e| Error::invalid(format!("callbackUrl is not a valid URL: {e}")))?;
        if !matches!(callback.scheme(), "http" | "https") {
            return Err(Error::invalid("callbackUrl must use http or https"));
        }

        Ok(())
    }

    fn fields(self) -> RegistrationFields {
        RegistrationFields {
            access_token: self.access_token,
            app_secret: self.app_secret,
            callback_url: self.callback_url,
        }
    }
}

/// Creates or renews the registration and makes sure a session is running for it.
pub async fn register(
    manager: &SessionManager,
    request: RegisterRequest,
) -> Result<(Model, StartOutcome), Error> {
    request.validate()?;

    let key = request.key();
    let registration = manager.store().upsert(&key, request.fields()).await?;
    let outcome = manager.start(registration.clone());

    info!("Registered {key} ({outcome:?})");
    Ok((registration, outcome))
}

/// Stops the session for `key` and destroys its registration.
pub async fn unregister(manager: &SessionManager, key: &RegistrationKey) -> Result<(), Error> {
    manager.stop(key).await?;
    info!("Unregistered {key}");
    Ok(())
}

/// Starts sessions for every stored registration. Called once at process start.
pub async fn restore(manager: &SessionManager) -> Result<usize, Error> {
    Ok(manager.restore().await?)
}
