use entity_api::registrations::Model as Registration;
use service::tables::{AppTable, InstanceTable};
use std::fmt;

/// Path of the user streaming endpoint on an upstream instance.
pub const STREAMING_PATH: &str = "/api/v1/streaming/";

/// Characters that would corrupt the query string the token is embedded into.
const FORBIDDEN_TOKEN_CHARS: [char; 4] = ['?', '&', '=', '/'];

/// Why a registration may not be connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    UnknownApp,
    SecretMismatch,
    UnknownInstance,
    MalformedToken,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rejection::UnknownApp => write!(f, "unknown app"),
            Rejection::SecretMismatch => write!(f, "app secret mismatch"),
            Rejection::UnknownInstance => write!(f, "unknown instance"),
            Rejection::MalformedToken => write!(f, "malformed access token"),
        }
    }
}

/// Side-effect free checks of a registration against the configured tables.
#[derive(Clone, Debug, Default)]
pub struct Validator {
    apps: AppTable,
    instances: InstanceTable,
}

impl Validator {
    pub fn new(apps: AppTable, instances: InstanceTable) -> Self {
        Self { apps, instances }
    }

    pub fn validate_app(&self, app_id: &str, app_secret: &str) -> Result<(), Rejection> {
        match self.apps.get(app_id) {
            None => Err(Rejection::UnknownApp),
            Some(app) if app.secret != app_secret => Err(Rejection::SecretMismatch),
            Some(_) => Ok(()),
        }
    }

    pub fn validate_instance(&self, instance_url: &str) -> Result<(), Rejection> {
        if self.instances.get(instance_url).is_some() || self.instances.allows_any() {
            Ok(())
        } else {
            Err(Rejection::UnknownInstance)
        }
    }

    pub fn validate_access_token(access_token: &str) -> Result<(), Rejection> {
        if access_token.is_empty() || access_token.contains(&FORBIDDEN_TOKEN_CHARS[..]) {
            Err(Rejection::MalformedToken)
        } else {
            Ok(())
        }
    }

    /// Runs every check, returning the first rejection (app, then instance, then token).
    pub fn validate(&self, registration: &Registration) -> Result<(), Rejection> {
        self.validate_app(&registration.app_id, &registration.app_secret)?;
        self.validate_instance(&registration.instance_url)?;
        Self::validate_access_token(&registration.access_token)
    }

    /// Address the upstream socket is opened against.
    ///
    /// This is the instance entry's `replaceUrl` when one is configured, the
    /// instance URL otherwise. The wildcard entry never rewrites.
    pub fn resolve_connect_url<'a>(&'a self, instance_url: &'a str) -> &'a str {
        self.instances
            .get(instance_url)
            .and_then(|entry| entry.replace_url.as_deref())
            .unwrap_or(instance_url)
    }

    /// Full streaming URL for a registration that passed `validate`.
    pub fn streaming_url(&self, registration: &Registration) -> String {
        let base = self.resolve_connect_url(&registration.instance_url);
        format!(
            "{}{STREAMING_PATH}?access_token={}&stream=user",
            base.trim_end_matches('/'),
            registration.access_token
        )
    }
}
