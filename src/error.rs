//! Error types for the crypto box.
//!
//! Every fallible operation returns [`CryptoboxError`]. Each variant maps to a
//! stable [`ErrorCode`] whose numbering follows the native result codes, so
//! callers bridging to other runtimes can forward the number unchanged.

use thiserror::Error;

use crate::store::StoreError;

/// Stable numeric error codes.
///
/// Codes 1 to 17 mirror the engine result codes. `IllegalState` and
/// `InvalidArgument` are raised by the manager layer only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    StorageError = 1,
    SessionNotFound = 2,
    DecodeError = 3,
    RemoteIdentityChanged = 4,
    InvalidSignature = 5,
    InvalidMessage = 6,
    DuplicateMessage = 7,
    TooDistantFuture = 8,
    OutdatedMessage = 9,
    Utf8Error = 10,
    NulError = 11,
    EncodeError = 12,
    IdentityError = 13,
    PrekeyNotFound = 14,
    Panic = 15,
    InitError = 16,
    DegeneratedKey = 17,
    IllegalState = 100,
    InvalidArgument = 101,
}

impl ErrorCode {
    /// The numeric value of this code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether the owning crypto box must be discarded and reopened.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorCode::Panic | ErrorCode::InitError)
    }

    /// Whether the offending message can be dropped silently.
    pub fn is_discardable(self) -> bool {
        matches!(self, ErrorCode::DuplicateMessage)
    }
}

/// Errors that can occur while operating a crypto box or one of its sessions.
#[derive(Debug, Error)]
pub enum CryptoboxError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("remote identity changed")]
    RemoteIdentityChanged,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("duplicate message")]
    DuplicateMessage,

    #[error("message is too far in the future")]
    TooDistantFuture,

    #[error("outdated message")]
    OutdatedMessage,

    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("string contains an interior NUL byte")]
    Nul,

    #[error("encode error: {0}")]
    Encode(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("prekey {0} not found")]
    PrekeyNotFound(u16),

    #[error("unrecoverable internal error: {0}")]
    Panic(String),

    #[error("initialisation failed: {0}")]
    Init(String),

    #[error("degenerated key material")]
    DegeneratedKey,

    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CryptoboxError {
    /// The stable code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            CryptoboxError::Storage(StoreError::Utf8(_)) => ErrorCode::Utf8Error,
            CryptoboxError::Storage(_) => ErrorCode::StorageError,
            CryptoboxError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            CryptoboxError::Decode(_) => ErrorCode::DecodeError,
            CryptoboxError::RemoteIdentityChanged => ErrorCode::RemoteIdentityChanged,
            CryptoboxError::InvalidSignature => ErrorCode::InvalidSignature,
            CryptoboxError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            CryptoboxError::DuplicateMessage => ErrorCode::DuplicateMessage,
            CryptoboxError::TooDistantFuture => ErrorCode::TooDistantFuture,
            CryptoboxError::OutdatedMessage => ErrorCode::OutdatedMessage,
            CryptoboxError::Utf8(_) => ErrorCode::Utf8Error,
            CryptoboxError::Nul => ErrorCode::NulError,
            CryptoboxError::Encode(_) => ErrorCode::EncodeError,
            CryptoboxError::Identity(_) => ErrorCode::IdentityError,
            CryptoboxError::PrekeyNotFound(_) => ErrorCode::PrekeyNotFound,
            CryptoboxError::Panic(_) => ErrorCode::Panic,
            CryptoboxError::Init(_) => ErrorCode::InitError,
            CryptoboxError::DegeneratedKey => ErrorCode::DegeneratedKey,
            CryptoboxError::IllegalState(_) => ErrorCode::IllegalState,
            CryptoboxError::InvalidArgument(_) => ErrorCode::InvalidArgument,
        }
    }

    /// Shorthand for [`ErrorCode::is_fatal`].
    pub fn is_fatal(&self) -> bool {
        self.code().is_fatal()
    }

    pub(crate) fn encode(err: impl std::fmt::Display) -> Self {
        CryptoboxError::Encode(err.to_string())
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        CryptoboxError::Panic(format!("{what} lock poisoned"))
    }
}

impl From<std::io::Error> for CryptoboxError {
    fn from(e: std::io::Error) -> Self {
        CryptoboxError::Storage(StoreError::Io(e))
    }
}

impl From<serde_json::Error> for CryptoboxError {
    fn from(e: serde_json::Error) -> Self {
        CryptoboxError::Decode(e.to_string())
    }
}

impl From<base64::DecodeError> for CryptoboxError {
    fn from(e: base64::DecodeError) -> Self {
        CryptoboxError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CryptoboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_follow_native_numbering() {
        assert_eq!(ErrorCode::StorageError.as_u16(), 1);
        assert_eq!(ErrorCode::PrekeyNotFound.as_u16(), 14);
        assert_eq!(ErrorCode::InitError.as_u16(), 16);
        assert_eq!(CryptoboxError::DuplicateMessage.code(), ErrorCode::DuplicateMessage);
    }

    #[test]
    fn test_only_panic_and_init_are_fatal() {
        assert!(CryptoboxError::Panic("boom".into()).is_fatal());
        assert!(CryptoboxError::Init("rng".into()).is_fatal());
        assert!(!CryptoboxError::InvalidSignature.is_fatal());
        assert!(ErrorCode::DuplicateMessage.is_discardable());
        assert!(!ErrorCode::OutdatedMessage.is_discardable());
    }

    #[test]
    fn test_io_errors_are_storage_errors() {
        let err: CryptoboxError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(err.code(), ErrorCode::StorageError);
    }
}
