use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one subscription: the upstream instance, the client app and the
/// client-chosen tag.
///
/// The instance URL is lowercased on construction so two registrations that
/// only differ by case collapse onto the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationKey {
    instance_url: String,
    app_id: String,
    tag: String,
}

impl RegistrationKey {
    pub fn new(
        instance_url: impl AsRef<str>,
        app_id: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            instance_url: instance_url.as_ref().to_lowercase(),
            app_id: app_id.into(),
            tag: tag.into(),
        }
    }

    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for RegistrationKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "instance={} app={} tag={}",
            self.instance_url, self.app_id, self.tag
        )
    }
}
