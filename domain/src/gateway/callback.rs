use crate::error::{DomainErrorKind, Error, ExternalErrorKind};
use async_trait::async_trait;
use entity_api::RegistrationKey;
use events::{EventHandler, NotificationEvent};
use log::*;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use service::config::Config;
use std::time::Duration;

/// Body POSTed to a registration's callback URL.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackMessage<'a> {
    pub instance_url: &'a str,
    pub tag: &'a str,
    pub app_id: &'a str,
    pub payload: &'a Value,
}

impl<'a> From<&'a NotificationEvent> for CallbackMessage<'a> {
    fn from(event: &'a NotificationEvent) -> Self {
        Self {
            instance_url: &event.instance_url,
            tag: &event.tag,
            app_id: &event.app_id,
            payload: &event.payload,
        }
    }
}

/// Delivers relayed notifications to subscriber callbacks.
///
/// One POST per notification, never retried.
pub struct CallbackDispatcher {
    client: reqwest::Client,
}

impl CallbackDispatcher {
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::with_timeout(config.callback_timeout())
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }

    /// POSTs `event` to its callback URL and returns the response status.
    ///
    /// A non-success status is an error.
    pub async fn dispatch(&self, event: &NotificationEvent) -> Result<StatusCode, Error> {
        let key = RegistrationKey::new(&event.instance_url, &event.app_id, &event.tag);
        debug!("Delivering notification for {key} to {}", event.callback_url);

        let response = self
            .client
            .post(&event.callback_url)
            .json(&CallbackMessage::from(event))
            .send()
            .await
            .map_err(|e| {
                warn!("Failed to deliver notification for {key}: {e:?}");
                Error::from(e)
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(status)
        } else {
            let error_text = response.text().await.unwrap_or_default();
            warn!("Callback for {key} answered {status} - {error_text}");
            Err(Error {
                source: None,
                error_kind: DomainErrorKind::External(ExternalErrorKind::Callback(status.as_u16())),
            })
        }
    }
}

#[async_trait]
impl EventHandler for CallbackDispatcher {
    async fn handle(&self, event: &NotificationEvent) {
        // Failures were already logged by `dispatch`; nothing flows back to the session.
        if let Ok(status) = self.dispatch(event).await {
            info!(
                "Delivered notification for instance={} app={} tag={}: {status}",
                event.instance_url, event.app_id, event.tag
            );
        }
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, Error> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        reqwest::header::HeaderValue::from_static("application/json"),
    );

    Ok(reqwest::Client::builder()
        .use_rustls_tls()
        .default_headers(headers)
        .timeout(timeout)
        .build()?)
}
