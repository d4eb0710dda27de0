use sea_orm::error::DbErr;
use serde::Serialize;

/// Coarse classification of a [`ServiceError`].
///
/// Handlers use this to decide between a redirect-with-message and a
/// structured error response without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing field, malformed CSV header, unknown size and similar.
    Validation,
    /// Cart, session, product or variant does not exist.
    NotFound,
    /// The request is well formed but not allowed in the current state.
    BusinessRule,
    /// The transaction failed and was rolled back.
    Persistence,
    /// Anything unexpected.
    Internal,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Io(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationError(_) | Self::InvalidInput(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidOperation(_) | Self::InvalidStatus(_) => ErrorKind::BusinessRule,
            Self::DatabaseError(_) | Self::Io(_) => ErrorKind::Persistence,
            Self::SerializationError(_) | Self::InternalError(_) | Self::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Returns the error message suitable for end users.
    /// Persistence and internal errors return generic messages to avoid leaking details.
    pub fn response_message(&self) -> String {
        match self.kind() {
            ErrorKind::Persistence | ErrorKind::Internal => {
                "Something went wrong, please try again".to_string()
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_mapping() {
        assert_eq!(
            ServiceError::NotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            ServiceError::ValidationError("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            ServiceError::InvalidInput("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            ServiceError::InvalidStatus("x".into()).kind(),
            ErrorKind::BusinessRule
        );
        assert_eq!(
            ServiceError::db_error("boom").kind(),
            ErrorKind::Persistence
        );
        assert_eq!(
            ServiceError::InternalError("x".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn response_message_hides_internal_details() {
        assert_eq!(
            ServiceError::db_error("connection reset by peer").response_message(),
            "Something went wrong, please try again"
        );
        assert_eq!(
            ServiceError::SerializationError("bad json".into()).response_message(),
            "Something went wrong, please try again"
        );

        assert_eq!(
            ServiceError::NotFound("Cart item not found".into()).response_message(),
            "Not found: Cart item not found"
        );
        assert_eq!(
            ServiceError::ValidationError("Size XL is not offered".into()).response_message(),
            "Validation error: Size XL is not offered"
        );
    }

    #[test]
    fn io_errors_convert() {
        let err: ServiceError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(matches!(err, ServiceError::Io(_)));
    }
}
