use contact_identity_core::{IdentityError, ResolveError};
use serde::{Deserialize, Serialize};

/// Stable error categories exposed to callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    StoreUnavailable,
    StoreFailure,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::NotFound => "not_found",
            Self::StoreUnavailable => "store_unavailable",
            Self::StoreFailure => "store_failure",
            Self::Internal => "internal",
        }
    }

    #[must_use]
    pub fn is_client_error(self) -> bool {
        matches!(self, Self::InvalidRequest | Self::NotFound)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("contact store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),
    #[error("contact store failure: {0:#}")]
    StoreFailure(anyhow::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            Self::StoreFailure(_) => ErrorKind::StoreFailure,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to hand to a caller. Client errors describe the problem; store and
    /// internal failures are reduced to a fixed sentence.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidRequest(message) | Self::NotFound(message) => message.clone(),
            Self::StoreUnavailable(_) => "contact store is unavailable".to_string(),
            Self::StoreFailure(_) => "contact store operation failed".to_string(),
            Self::Internal(_) => "internal error".to_string(),
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Validation(message) => Self::InvalidRequest(message),
            IdentityError::Integrity(message) => Self::Internal(message),
        }
    }
}

impl From<ResolveError<anyhow::Error>> for ApiError {
    fn from(err: ResolveError<anyhow::Error>) -> Self {
        match err {
            ResolveError::Unavailable(source) => Self::StoreUnavailable(source),
            ResolveError::Lookup(source) | ResolveError::Insert(source) => {
                Self::StoreFailure(source)
            }
            ResolveError::Identity(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn store_errors_hide_driver_text_from_callers() {
        let err: ApiError =
            ResolveError::Insert(anyhow!("UNIQUE constraint failed: contact.secret_column")).into();

        assert_eq!(err.kind(), ErrorKind::StoreFailure);
        assert!(!err.public_message().contains("secret_column"));
        assert!(err.to_string().contains("secret_column"));
    }

    #[test]
    fn identity_errors_map_to_request_and_internal_kinds() {
        let invalid: ApiError = IdentityError::Validation("email missing".to_string()).into();
        assert_eq!(invalid.kind(), ErrorKind::InvalidRequest);
        assert_eq!(invalid.public_message(), "email missing");
        assert!(invalid.kind().is_client_error());

        let broken: ApiError = ResolveError::<anyhow::Error>::Identity(IdentityError::Integrity(
            "secondary contact 4 has no linked primary".to_string(),
        ))
        .into();
        assert_eq!(broken.kind(), ErrorKind::Internal);
        assert_eq!(broken.public_message(), "internal error");
        assert!(!broken.kind().is_client_error());
    }
}
