use super::error::DomainError;

/// Result of a room or negotiation operation
pub type Result<T> = std::result::Result<T, DomainError>;
