//! Error types for the proxy core

use core::fmt;

use crate::config::ConfigError;

/// Result type for proxy core operations
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors that can occur in the reactor, channel and process layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// Operation would block (EAGAIN); retry on the next readiness event
    WouldBlock,

    /// A blocking wait was broken by the drain alarm
    Interrupted,

    /// Peer closed the connection or channel
    Closed,

    /// Malformed control-channel frame (short read or unknown command)
    BadFrame,

    /// Internal contract violation (kept loud instead of asserting)
    Internal(&'static str),

    /// Configuration rejected by validation
    Config(ConfigError),

    /// Raw OS error (errno)
    Os(i32),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::WouldBlock => write!(f, "operation would block"),
            ProxyError::Interrupted => write!(f, "wait interrupted by alarm"),
            ProxyError::Closed => write!(f, "peer closed"),
            ProxyError::BadFrame => write!(f, "malformed control frame"),
            ProxyError::Internal(msg) => write!(f, "internal error: {}", msg),
            ProxyError::Config(e) => write!(f, "config error: {}", e),
            ProxyError::Os(errno) => write!(f, "os error: errno {}", errno),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<ConfigError> for ProxyError {
    fn from(e: ConfigError) -> Self {
        ProxyError::Config(e)
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock => ProxyError::WouldBlock,
            std::io::ErrorKind::Interrupted => ProxyError::Interrupted,
            _ => ProxyError::Os(e.raw_os_error().unwrap_or(0)),
        }
    }
}

impl ProxyError {
    /// Build from the errno left behind by a raw libc call.
    pub fn last_os() -> Self {
        ProxyError::from(std::io::Error::last_os_error())
    }

    /// True for the transient kinds a caller should retry on
    pub fn is_transient(&self) -> bool {
        matches!(self, ProxyError::WouldBlock | ProxyError::Interrupted)
    }
}
