use thiserror::Error;

/// Failures reported back to a client. Every variant reaches the client as an
/// `error` push carrying [`code`](RelayError::code); none of them close the
/// connection except a failed `auth`.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("authenticate first")]
    NotAuthenticated,

    #[error("connection is already authenticated")]
    AlreadyBound,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("not a member of this conversation")]
    NotAMember,

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("unknown identity")]
    UnknownIdentity,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("storage temporarily unavailable")]
    PersistenceUnavailable,
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::NotAuthenticated => "NOT_AUTHENTICATED",
            RelayError::AlreadyBound => "ALREADY_BOUND",
            RelayError::AuthenticationFailed => "AUTHENTICATION_FAILED",
            RelayError::NotAMember => "NOT_A_MEMBER",
            RelayError::MalformedEnvelope(_) => "MALFORMED_ENVELOPE",
            RelayError::UnknownIdentity => "UNKNOWN_IDENTITY",
            RelayError::InvalidRequest(_) => "INVALID_REQUEST",
            RelayError::ConnectionClosed => "CONNECTION_CLOSED",
            RelayError::PersistenceUnavailable => "PERSISTENCE_UNAVAILABLE",
        }
    }
}

/// Storage failures as the gateway sees them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Busy, locked, or otherwise transient. Reads may retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store failure: {0}")]
    Failed(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<StoreError> for RelayError {
    fn from(_: StoreError) -> Self {
        RelayError::PersistenceUnavailable
    }
}
