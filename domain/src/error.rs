//! Error types for the `domain` layer.
use entity_api::error::{EntityApiErrorKind, Error as EntityApiError};
use relay::error::{Error as RelayError, RelayErrorKind};
use std::error::Error as StdError;
use std::fmt;

/// Top-level domain error type.
/// Errors in the Domain layer are modeled as a tree structure
/// with `domain::error::Error` as the root type holding a tree of `error_kind`
/// enums that represent the kinds of errors that can occur in the domain layer or
/// in lower layers. The `source` field is used to hold the original error that caused
/// the domain error. Errors from `entity_api` and `relay` are translated here so
/// callers of `domain` never match on lower-layer error kinds.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: DomainErrorKind,
}

/// Enum representing the major categories of errors that can occur in the `domain` layer.
#[derive(Debug, PartialEq)]
pub enum DomainErrorKind {
    Internal(InternalErrorKind),
    External(ExternalErrorKind),
}

/// Enum representing the various kinds of internal errors that can occur in the `domain` layer.
#[derive(Debug, PartialEq)]
pub enum InternalErrorKind {
    Entity(EntityErrorKind),
    /// A register request failed basic validation
    Invalid(String),
    Other(String),
}

/// Entity errors reduced to the subset that matters to the `domain` layer.
#[derive(Debug, PartialEq)]
pub enum EntityErrorKind {
    NotFound,
    DbTransaction,
    Other(String),
}

/// Enum representing the various kinds of external errors that can occur in the `domain` layer.
#[derive(Debug, PartialEq)]
pub enum ExternalErrorKind {
    Network,
    /// A callback endpoint answered with a non-success status
    Callback(u16),
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error {
            source: None,
            error_kind: DomainErrorKind::Internal(InternalErrorKind::Invalid(message.into())),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Domain Error: {self:?}")
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

// This is where we translate errors from the `entity_api` layer to the `domain` layer.
impl From<EntityApiError> for Error {
    fn from(err: EntityApiError) -> Self {
        let entity_error_kind = match err.error_kind {
            EntityApiErrorKind::RecordNotFound => EntityErrorKind::NotFound,
            EntityApiErrorKind::SystemError => EntityErrorKind::DbTransaction,
            _ => EntityErrorKind::Other("EntityErrorKind".to_string()),
        };

        Error {
            source: Some(Box::new(err)),
            error_kind: DomainErrorKind::Internal(InternalErrorKind::Entity(entity_error_kind)),
        }
    }
}

impl From<RelayError> for Error {
    fn from(err: RelayError) -> Self {
        let error_kind = match err.error_kind {
            RelayErrorKind::Store => {
                DomainErrorKind::Internal(InternalErrorKind::Entity(EntityErrorKind::DbTransaction))
            }
        };

        Error {
            source: Some(Box::new(err)),
            error_kind,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // Errors that result from issues building the reqwest::Client instance. This
        // type of error will occur prior to any network calls being made.
        if err.is_builder() {
            Error {
                source: Some(Box::new(err)),
                error_kind: DomainErrorKind::Internal(InternalErrorKind::Other(
                    "Failed to build reqwest client".to_string(),
                )),
            }
        // Errors that result from issues with the network call itself.
        } else {
            Error {
                source: Some(Box::new(err)),
                error_kind: DomainErrorKind::External(ExternalErrorKind::Network),
            }
        }
    }
}
