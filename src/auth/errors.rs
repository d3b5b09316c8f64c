//! Authentication and authorization error types.

use thiserror::Error;

/// Errors returned by the auth core
#[derive(Debug, Error)]
pub enum AuthError {
    /// Credentials or token did not resolve to a user
    #[error("invalid credentials")]
    Unauthenticated,

    /// The caller may not perform the requested operation on the topic
    #[error("unauthorized")]
    Unauthorized,

    /// User not found
    #[error("user not found")]
    UserNotFound,

    /// Username already exists
    #[error("user already exists")]
    UserExists,

    /// Token not found
    #[error("token not found")]
    TokenNotFound,

    /// An empty token was passed to a token operation
    #[error("no token provided")]
    NoTokenProvided,

    /// Tier not found
    #[error("tier not found")]
    TierNotFound,

    /// Phone number not found
    #[error("phone number not found")]
    PhoneNumberNotFound,

    /// Phone number already exists for this user
    #[error("phone number already exists")]
    PhoneNumberExists,

    /// The target tier does not leave room for the user's current reservations
    #[error("too many reservations")]
    TooManyReservations,

    /// The topic is covered by a grant owned by another user
    #[error("topic owned by others")]
    TopicOwnedByOthers,

    /// A username, topic, pattern, tier code, or role failed validation
    #[error("invalid argument")]
    InvalidArgument,

    /// A caller-supplied password hash is not a valid PHC string
    #[error("invalid password hash")]
    InvalidPasswordHash,

    /// Password hashing failed
    #[error("password hashing failed")]
    HashingFailed,

    /// The database schema is newer than this binary supports
    #[error("unexpected schema version: version {found} is higher than current version {supported}")]
    UnexpectedSchemaVersion { found: i64, supported: i64 },

    /// The directory holding the database file does not exist
    #[error("database directory {0} does not exist or is not accessible")]
    InvalidDatabasePath(String),

    /// Startup provisioning could not converge on the configured state
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Preferences (de)serialization error
    #[error("preferences error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AuthError {
    /// Get a client-safe error message that doesn't leak sensitive information
    ///
    /// Database and hashing errors are sanitized to prevent information
    /// disclosure about the internal system structure. Authentication
    /// failures never reveal which precondition failed.
    pub fn client_message(&self) -> String {
        match self {
            AuthError::Database(_) | AuthError::Json(_) | AuthError::HashingFailed => {
                "internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

/// Result type for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Translate a unique-constraint violation into the given domain error,
/// passing every other database error through verbatim.
pub(crate) fn map_unique_violation(err: sqlx::Error, domain: AuthError) -> AuthError {
    match err.as_database_error() {
        Some(dbe) if dbe.is_unique_violation() => domain,
        _ => AuthError::Database(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_sanitizes_internal_errors() {
        let err = AuthError::Database(sqlx::Error::RowNotFound);
        assert_eq!(err.client_message(), "internal server error");
        assert_eq!(AuthError::Unauthenticated.client_message(), "invalid credentials");
        assert_eq!(AuthError::TooManyReservations.client_message(), "too many reservations");
    }
}
