//! Error types for the `relay` crate.
use entity_api::error::Error as EntityApiError;
use std::error::Error as StdError;
use std::fmt;

/// Errors surfaced to callers of the session manager.
///
/// Connectivity and delivery problems never show up here: they are retried or
/// logged inside the session. Only store failures on operations a caller
/// triggered are returned.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: RelayErrorKind,
}

#[derive(Debug, PartialEq)]
pub enum RelayErrorKind {
    // Registration store could not complete the operation
    Store,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Relay Error: {self:?}")
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<EntityApiError> for Error {
    fn from(err: EntityApiError) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: RelayErrorKind::Store,
        }
    }
}
