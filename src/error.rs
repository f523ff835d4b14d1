//! Error types for the proxy and its embedded network stack.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while proxying.
#[derive(Error, Debug)]
pub enum Error {
    /// TUN device setup or I/O failed
    #[error("tun device error: {0}")]
    Tun(String),

    /// Network I/O error on an OS socket
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Client spoke a SOCKS version other than 5
    #[error("bad SOCKS version: {0}")]
    BadVersion(u8),

    /// Client offered no authentication method we accept
    #[error("no acceptable authentication method")]
    NoAcceptableAuth,

    /// Client requested a command other than CONNECT
    #[error("unsupported SOCKS command: {0}")]
    UnsupportedCommand(String),

    /// Client requested an address type we cannot connect to
    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(String),

    /// Domain-name targets need a resolver that is not wired in yet
    #[error("domain-name target not resolvable: {0}")]
    DomainNotResolved(String),

    /// The embedded stack rejected an operation
    #[error("stack error: {0}")]
    Stack(String),

    /// The stack driver is gone; no further stack operations are possible
    #[error("stack driver unavailable")]
    DriverGone,

    /// The remote endpoint reset or errored the connection
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new stack error
    pub fn stack(msg: impl Into<String>) -> Self {
        Error::Stack(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error is a SOCKS protocol reject.
    ///
    /// Protocol rejects drop the session without writing any reply bytes;
    /// they are logged at debug level because clients probing us are routine.
    pub fn is_protocol_reject(&self) -> bool {
        matches!(
            self,
            Error::BadVersion(_)
                | Error::NoAcceptableAuth
                | Error::UnsupportedCommand(_)
                | Error::UnsupportedAddressType(_)
                | Error::DomainNotResolved(_)
        )
    }
}
