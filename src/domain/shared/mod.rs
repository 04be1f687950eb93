//! Shared kernel - identifiers and errors used by every part of the crate

pub mod error;
pub mod result;
pub mod value_objects;

pub use error::DomainError;
pub use result::Result;
pub use value_objects::*;
