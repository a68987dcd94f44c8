use crate::raft::RaftId;

use serde::{Deserialize, Serialize};

/// A vgsync error. Errors are returned to clients in reply messages, so they
/// must be serializable and cheap to clone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
pub enum Error {
    /// The operation was aborted and must be retried. This typically happens
    /// with leader changes, when pending client requests can't be completed.
    #[error("operation aborted")]
    Abort,
    /// A wire message could not be decoded. The message is dropped.
    #[error("decode error: {0}")]
    Decode(String),
    /// Invalid data, typically decoding errors of persisted state or
    /// unexpected internal values.
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// Invalid user input, typically configuration or request errors.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// An IO error.
    #[error("io error: {0}")]
    IO(String),
    /// The request was submitted to a node that isn't the group leader. Carries
    /// the believed leader, if any, so the caller can redirect.
    #[error("not leader (leader hint {0:?})")]
    NotLeader(Option<RaftId>),
    /// An internal error, e.g. a closed channel or a collaborator failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A vgsync result.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
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
