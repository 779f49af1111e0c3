//! Unified error taxonomy for the daemon and its collaborators.
//!
//! Every fallible operation in the crate returns a [`CoreError`], carrying a
//! stable numeric code so the control socket and logs can report failures
//! the same way regardless of which subsystem raised them.

use thiserror::Error;

/// Stable error code, grouped by subsystem in blocks of 1000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    // Network (1000-1999)
    ConnectionFailed = 1000,
    PeerNotFound = 1001,
    DiscoveryFailed = 1002,
    BandwidthLimitExceeded = 1003,

    // Security (2000-2999)
    SessionCodeMismatch = 2000,
    CertVerifyFailed = 2001,
    EncryptionFailed = 2002,
    AuthFail = 2003,
    Replay = 2004,
    CryptoBadKeySize = 2005,
    CryptoBadNonce = 2006,
    CryptoAuthFail = 2007,
    CryptoBadPadding = 2008,

    // Sync (3000-3999)
    FileNotFound = 3000,
    ConflictDetected = 3001,
    SyncInProgress = 3002,
    DeltaGenFailed = 3003,
    ResolveEmptyRemote = 3004,
    ResolveLocalMissing = 3005,
    ResolveWriteFailed = 3006,

    // Storage (4000-4999)
    DiskFull = 4000,
    PermissionDenied = 4001,
    FileCorrupted = 4002,

    // System (5000-5999)
    DaemonNotRunning = 5000,
    Internal = 5001,
    InvalidConfig = 5002,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// The component that raised an error, reported alongside the code in logs
/// and on the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Network,
    Security,
    Sync,
    Storage,
    System,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Component::Network => "network",
            Component::Security => "security",
            Component::Sync => "sync",
            Component::Storage => "storage",
            Component::System => "system",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
#[error("[{component}] {code} {message}{}", details.as_ref().map(|d| format!(" ({d})")).unwrap_or_default())]
pub struct CoreError {
    pub code: ErrorCode,
    pub component: Component,
    pub message: String,
    pub details: Option<String>,
}

impl CoreError {
    pub fn new(code: ErrorCode, component: Component, message: impl Into<String>) -> Self {
        Self {
            code,
            component,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

macro_rules! ctor {
    ($name:ident, $code:ident, $component:ident) => {
        pub fn $name(message: impl Into<String>) -> CoreError {
            CoreError::new(ErrorCode::$code, Component::$component, message)
        }
    };
}

ctor!(connection_failed, ConnectionFailed, Network);
ctor!(peer_not_found, PeerNotFound, Network);
ctor!(discovery_failed, DiscoveryFailed, Network);
ctor!(bandwidth_limit_exceeded, BandwidthLimitExceeded, Network);

ctor!(session_code_mismatch, SessionCodeMismatch, Security);
ctor!(cert_verify_failed, CertVerifyFailed, Security);
ctor!(encryption_failed, EncryptionFailed, Security);
ctor!(auth_fail, AuthFail, Security);
ctor!(replay, Replay, Security);
ctor!(crypto_bad_key_size, CryptoBadKeySize, Security);
ctor!(crypto_bad_nonce, CryptoBadNonce, Security);
ctor!(crypto_auth_fail, CryptoAuthFail, Security);
ctor!(crypto_bad_padding, CryptoBadPadding, Security);

ctor!(file_not_found, FileNotFound, Sync);
ctor!(conflict_detected, ConflictDetected, Sync);
ctor!(sync_in_progress, SyncInProgress, Sync);
ctor!(delta_gen_failed, DeltaGenFailed, Sync);
ctor!(resolve_empty_remote, ResolveEmptyRemote, Sync);
ctor!(resolve_local_missing, ResolveLocalMissing, Sync);
ctor!(resolve_write_failed, ResolveWriteFailed, Sync);

ctor!(disk_full, DiskFull, Storage);
ctor!(permission_denied, PermissionDenied, Storage);
ctor!(file_corrupted, FileCorrupted, Storage);

ctor!(daemon_not_running, DaemonNotRunning, System);
ctor!(internal, Internal, System);
ctor!(invalid_config, InvalidConfig, System);

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => file_not_found(e.to_string()),
            std::io::ErrorKind::PermissionDenied => permission_denied(e.to_string()),
            _ => internal(e.to_string()),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
