use thiserror::Error;

/// agent error taxonomy.
///
/// wire-layer failures stay local: a malformed or unauthenticated
/// datagram is dropped and logged, never surfaced to the peer unless a
/// STUN error response is required.  transaction failures fail only
/// their owning transaction; agent-level failures surface through one
/// state change.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("malformed datagram")]
    Malformed,
    #[error("message integrity mismatch")]
    IntegrityMismatch,
    #[error("message integrity missing")]
    IntegrityMissing,
    #[error("unauthorized")]
    Unauthorized,
    #[error("stale nonce")]
    StaleNonce,
    #[error("role conflict")]
    RoleConflict,
    #[error("unknown comprehension-required attributes: {0:?}")]
    UnknownRequired(Vec<u16>),
    #[error("transaction timed out")]
    Timeout,
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl From<stun::StunError> for Error {
    fn from(value: stun::StunError) -> Self {
        match value {
            stun::StunError::Malformed => Self::Malformed,
            stun::StunError::UnknownRequired(kinds) => Self::UnknownRequired(kinds),
            stun::StunError::IntegrityMissing => Self::IntegrityMissing,
            stun::StunError::IntegrityMismatch => Self::IntegrityMismatch,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
