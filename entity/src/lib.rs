use uuid::Uuid;

pub mod registration_key;
pub mod registrations;

pub use registration_key::RegistrationKey;

/// A type alias that represents any Entity's internal id field data type.
/// Aliased so that it's easy to change the underlying type if necessary.
pub type Id = Uuid;
