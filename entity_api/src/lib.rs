pub use entity::{registrations, Id, RegistrationKey};

pub mod error;
pub mod registration;
pub mod store;
