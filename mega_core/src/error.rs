//! Error taxonomy shared by all engine subsystems.
//!
//! API errors are a flat numeric space defined by the server; the client
//! classifies each code into a handling policy (retry, surface, terminate)
//! rather than giving each one its own type.

use thiserror::Error;

/// Numeric error codes returned by the API server.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiError {
    #[error("internal server error")]
    Internal,
    #[error("bad arguments")]
    Args,
    #[error("server busy, retry")]
    Again,
    #[error("rate limited")]
    RateLimit,
    #[error("request failed permanently")]
    Failed,
    #[error("too many pending updates")]
    TooMany,
    #[error("range error")]
    Range,
    #[error("resource expired")]
    Expired,
    #[error("not found")]
    NotFound,
    #[error("circular link")]
    Circular,
    #[error("access denied")]
    Access,
    #[error("already exists")]
    Exists,
    #[error("incomplete")]
    Incomplete,
    #[error("invalid key / decryption failure")]
    Key,
    #[error("session id invalid")]
    Sid,
    #[error("account blocked")]
    Blocked,
    #[error("over quota")]
    OverQuota,
    #[error("temporarily unavailable")]
    TempUnavail,
    #[error("too many connections")]
    TooManyConnections,
    #[error("local write failure")]
    Write,
    #[error("local read failure")]
    Read,
    #[error("invalid application key")]
    AppKey,
    #[error("SSL verification failed")]
    Ssl,
    #[error("going over quota")]
    GoingOverQuota,
    #[error("multi-factor authentication required")]
    MfaRequired,
    #[error("access denied for sub-users")]
    MasterOnly,
    #[error("business account expired")]
    BusinessPastDue,
    #[error("storage paywall reached")]
    Paywall,
    /// A code this client does not know. Kept verbatim for diagnostics.
    #[error("unknown API error {0}")]
    Unknown(i32),
}

impl ApiError {
    pub fn code(&self) -> i32 {
        match self {
            ApiError::Internal => -1,
            ApiError::Args => -2,
            ApiError::Again => -3,
            ApiError::RateLimit => -4,
            ApiError::Failed => -5,
            ApiError::TooMany => -6,
            ApiError::Range => -7,
            ApiError::Expired => -8,
            ApiError::NotFound => -9,
            ApiError::Circular => -10,
            ApiError::Access => -11,
            ApiError::Exists => -12,
            ApiError::Incomplete => -13,
            ApiError::Key => -14,
            ApiError::Sid => -15,
            ApiError::Blocked => -16,
            ApiError::OverQuota => -17,
            ApiError::TempUnavail => -18,
            ApiError::TooManyConnections => -19,
            ApiError::Write => -20,
            ApiError::Read => -21,
            ApiError::AppKey => -22,
            ApiError::Ssl => -23,
            ApiError::GoingOverQuota => -24,
            ApiError::MfaRequired => -26,
            ApiError::MasterOnly => -27,
            ApiError::BusinessPastDue => -28,
            ApiError::Paywall => -29,
            ApiError::Unknown(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> ApiError {
        match code {
            -1 => ApiError::Internal,
            -2 => ApiError::Args,
            -3 => ApiError::Again,
            -4 => ApiError::RateLimit,
            -5 => ApiError::Failed,
            -6 => ApiError::TooMany,
            -7 => ApiError::Range,
            -8 => ApiError::Expired,
            -9 => ApiError::NotFound,
            -10 => ApiError::Circular,
            -11 => ApiError::Access,
            -12 => ApiError::Exists,
            -13 => ApiError::Incomplete,
            -14 => ApiError::Key,
            -15 => ApiError::Sid,
            -16 => ApiError::Blocked,
            -17 => ApiError::OverQuota,
            -18 => ApiError::TempUnavail,
            -19 => ApiError::TooManyConnections,
            -20 => ApiError::Write,
            -21 => ApiError::Read,
            -22 => ApiError::AppKey,
            -23 => ApiError::Ssl,
            -24 => ApiError::GoingOverQuota,
            -26 => ApiError::MfaRequired,
            -27 => ApiError::MasterOnly,
            -28 => ApiError::BusinessPastDue,
            -29 => ApiError::Paywall,
            other => ApiError::Unknown(other),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Again
            | ApiError::RateLimit
            | ApiError::TempUnavail
            | ApiError::TooManyConnections => ErrorKind::Throttling,
            ApiError::Internal | ApiError::Ssl => ErrorKind::Transport,
            ApiError::OverQuota | ApiError::GoingOverQuota | ApiError::Paywall => ErrorKind::Quota,
            ApiError::Sid | ApiError::Blocked => ErrorKind::Session,
            ApiError::Key => ErrorKind::Crypto,
            _ => ErrorKind::Semantic,
        }
    }

    /// Whether the request should be silently retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Throttling | ErrorKind::Transport)
            && *self != ApiError::Ssl
    }
}

/// Handling policy buckets for the flat error space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connectivity lost, SSL pin failure, 5xx. Retry with capped backoff.
    Transport,
    /// Server asked us to slow down. Retry, never surfaced as an error.
    Throttling,
    /// A real answer about this request. Surfaced to the completion.
    Semantic,
    /// Storage or bandwidth quota. Pause the affected work, flag globally.
    Quota,
    /// The session is dead. Stop the stream, notify, do not retry.
    Session,
    /// Key material disagreement. Preserve tracked state, raise callback.
    Crypto,
}

/// Failures decoding wire or cache byte forms.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid base64: {0:?}")]
    BadBase64(String),
    #[error("invalid handle: {0:?}")]
    BadHandle(String),
    #[error("bad length: expected {expected}, got {actual}")]
    BadLength { expected: usize, actual: usize },
    #[error("truncated record")]
    Truncated,
    #[error("attribute blob integrity check failed")]
    BadAttrMagic,
    #[error("malformed link: {0}")]
    BadLink(String),
    #[error("unsupported version byte {0}")]
    BadVersion(u8),
    #[error("HMAC mismatch")]
    BadMac,
}

/// Reasons a configured sync stops running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    NoError,
    InvalidRemoteType,
    ActiveSyncAbovePath,
    ActiveSyncBelowPath,
    ShareNonFullAccess,
    RemoteNodeInsideRubbish,
    RemoteNodeNotFound,
    UnsupportedFileSystem,
    LocalFingerprintMismatch,
    LocalPathUnavailable,
    BackupModified,
    InitialScanFailed,
    PutNodesError,
    UnknownError,
}

impl SyncError {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncError::NoError => "no error",
            SyncError::InvalidRemoteType => "remote root is not a folder",
            SyncError::ActiveSyncAbovePath => "another sync is above this path",
            SyncError::ActiveSyncBelowPath => "another sync is below this path",
            SyncError::ShareNonFullAccess => "in-share without full access",
            SyncError::RemoteNodeInsideRubbish => "remote root is in the rubbish bin",
            SyncError::RemoteNodeNotFound => "remote root not found",
            SyncError::UnsupportedFileSystem => "local filesystem unsupported",
            SyncError::LocalFingerprintMismatch => "local volume changed",
            SyncError::LocalPathUnavailable => "local path unavailable",
            SyncError::BackupModified => "backup destination was modified",
            SyncError::InitialScanFailed => "initial scan failed",
            SyncError::PutNodesError => "node creation failed",
            SyncError::UnknownError => "unknown error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for code in -29..=-1 {
            if code == -25 {
                continue; // unassigned
            }
            let err = ApiError::from_code(code);
            assert_eq!(err.code(), code);
            assert!(!matches!(err, ApiError::Unknown(_)));
        }
        assert_eq!(ApiError::from_code(-99), ApiError::Unknown(-99));
        assert_eq!(ApiError::Unknown(-99).code(), -99);
    }

    #[test]
    fn test_retry_classification() {
        assert!(ApiError::Again.is_retryable());
        assert!(ApiError::RateLimit.is_retryable());
        assert!(!ApiError::Access.is_retryable());
        assert!(!ApiError::Sid.is_retryable());
        // SSL pin failures surface instead of retrying by default
        assert!(!ApiError::Ssl.is_retryable());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(ApiError::OverQuota.kind(), ErrorKind::Quota);
        assert_eq!(ApiError::Blocked.kind(), ErrorKind::Session);
        assert_eq!(ApiError::Key.kind(), ErrorKind::Crypto);
        assert_eq!(ApiError::Exists.kind(), ErrorKind::Semantic);
    }
}
