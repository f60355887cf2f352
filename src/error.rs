//! Error types untuk connection engine
//!
//! Dua lapis:
//! - `NetError`: apa yang dilaporkan collaborator (resolver, socket)
//! - `EngineError`: error-code space kecil dan stabil yang dikirim ke atas
//!   sebagai `loading-failed(code)`

use std::io;
use thiserror::Error;

/// Result type untuk operasi engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Error dari resolver atau socket
#[derive(Debug, Error)]
pub enum NetError {
    #[error("host not found")]
    HostNotFound,

    /// Resolver churn: lookup boleh diulang
    #[error("resolver asked to try again")]
    TryAgain,

    #[error("network unreachable")]
    NetworkUnreachable,

    #[error("operation timed out")]
    TimedOut,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connect failed")]
    ConnectFailed,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("send failed")]
    SendFailed,

    #[error("receive failed")]
    RecvFailed,

    #[error("out of memory")]
    OutOfMemory,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NetError {
    /// Map `io::Error` ke taxonomy yang relevan
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Self::ConnectionReset
            }
            io::ErrorKind::TimedOut => Self::TimedOut,
            io::ErrorKind::OutOfMemory => Self::OutOfMemory,
            _ => Self::Io(err),
        }
    }
}

/// Error engine dengan code numerik yang stabil
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("illegal host name: {0:?}")]
    IllegalHost(String),

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("network unreachable")]
    NetworkUnreachable,

    #[error("name resolution timed out")]
    ResolveTimedOut,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connect failed")]
    ConnectFailed,

    #[error("connect timed out")]
    ConnectTimedOut,

    #[error("connection reset")]
    ConnectionReset,

    #[error("send failed")]
    SendFailed,

    #[error("receive failed")]
    RecvFailed,

    /// Public-network origin mencoba mencapai private/local address
    #[error("cross-network request blocked: {0}")]
    CrossNetwork(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("unknown connection {0}")]
    UnknownConnection(u64),

    /// Handle arena yang slot-nya sudah dipakai ulang atau dibebaskan
    #[error("stale connection handle (slot {index}, generation {generation})")]
    StaleHandle { index: u32, generation: u32 },

    #[error("connection is not connected")]
    NotConnected,

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Code numerik untuk `loading-failed(code)`
    pub fn code(&self) -> u32 {
        match self {
            Self::IllegalHost(_) => 1,
            Self::HostNotFound(_) => 2,
            Self::HostUnreachable(_) => 3,
            Self::NetworkUnreachable => 4,
            Self::ResolveTimedOut => 5,
            Self::ConnectionRefused => 6,
            Self::ConnectFailed => 7,
            Self::ConnectTimedOut => 8,
            Self::ConnectionReset => 9,
            Self::SendFailed => 10,
            Self::RecvFailed => 11,
            Self::CrossNetwork(_) => 12,
            Self::OutOfMemory => 13,
            Self::UnknownConnection(_) => 14,
            Self::NotConnected => 15,
            Self::Config(_) => 16,
            Self::StaleHandle { .. } => 17,
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Translate resolver error (di boundary connection)
    pub fn from_resolve(host: &str, err: NetError) -> Self {
        match err {
            NetError::NetworkUnreachable => Self::NetworkUnreachable,
            NetError::TimedOut => Self::ResolveTimedOut,
            NetError::OutOfMemory => Self::OutOfMemory,
            _ => Self::HostNotFound(host.to_string()),
        }
    }

    /// Translate connect error
    pub fn from_connect(err: NetError) -> Self {
        match err {
            NetError::ConnectionRefused => Self::ConnectionRefused,
            NetError::NetworkUnreachable => Self::NetworkUnreachable,
            NetError::TimedOut => Self::ConnectTimedOut,
            NetError::OutOfMemory => Self::OutOfMemory,
            _ => Self::ConnectFailed,
        }
    }

    /// Translate send/recv error
    pub fn from_io(err: NetError, sending: bool) -> Self {
        match err {
            NetError::ConnectionReset => Self::ConnectionReset,
            NetError::OutOfMemory => Self::OutOfMemory,
            _ if sending => Self::SendFailed,
            _ => Self::RecvFailed,
        }
    }
}
