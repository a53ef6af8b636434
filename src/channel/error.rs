//! Channel failure causes.

use thiserror::Error;

/// Why a channel operation or the channel itself failed. Cloneable so one
/// cause can be fanned out to every pending completion when a channel closes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("i/o failure: {kind:?}: {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
    #[error("tcp connect failed: {0}")]
    ConnectFailed(String),
    #[error("channel is closed")]
    Closed,
    #[error("channel is already registered with a selector")]
    AlreadyRegistered,
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
