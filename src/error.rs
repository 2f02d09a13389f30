//! Crate-wide error types.
//!
//! Errors carry strings rather than source errors, since they cross thread
//! boundaries and are mostly logged rather than inspected. Fatal protocol
//! integrity violations (e.g. truncating an executed log entry) are not
//! errors but panics: they indicate a bug in the engine itself and must not
//! be swallowed by a retry loop.

/// A consensus engine error.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// An invalid input or configuration, e.g. a malformed address or a
    /// member index outside the configuration.
    InvalidInput(String),
    /// A network or IO error. These are recoverable at the connection level:
    /// the session is closed and redialed or re-accepted.
    Io(String),
    /// An internal failure, e.g. a node lock that could not be acquired
    /// within its bounded wait. Treated as fatal by callers.
    Internal(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidInput(s) => write!(f, "invalid input: {s}"),
            Error::Io(s) => write!(f, "io error: {s}"),
            Error::Internal(s) => write!(f, "internal error: {s}"),
        }
    }
}

/// A crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::Internal(err.to_string())
    }
}
