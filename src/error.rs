use std::io;
use std::net::SocketAddr;
use std::result::Result as StdResult;

use thiserror::Error;

pub type Result<T> = StdResult<T, Error>;

/// Failures surfaced by the framework, from socket-level faults to
/// protocol-decoder rejections.
///
/// The distinction that matters operationally is [`Error::is_io`]: an I/O
/// classed failure observed on a session closes it, anything else is
/// reported through `exception_caught` and leaves the session open.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    #[error("address {0} is already bound")]
    AlreadyBound(SocketAddr),

    #[error("session {0} is closed")]
    SessionClosed(u64),

    #[error("buffer underflow: needed {needed} bytes, {available} available")]
    BufferUnderflow { needed: usize, available: usize },

    #[error("buffer overflow: needed {needed} bytes, {available} available")]
    BufferOverflow { needed: usize, available: usize },

    #[error("decoder failure: {0}")]
    Decoder(String),

    #[error("unexpected end of input: {0}")]
    UnexpectedEof(String),

    #[error("write reached the head of the filter chain without an encoded buffer")]
    Unencoded,

    #[error("handler failure: {0}")]
    Handler(String),
}

impl Error {
    /// Whether this failure is I/O classed. Sessions observing an I/O
    /// failure are scheduled for close; all other failures are advisory.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    pub fn decoder(message: impl Into<String>) -> Self {
        Error::Decoder(message.into())
    }

    pub fn unexpected_eof(message: impl Into<String>) -> Self {
        Error::UnexpectedEof(message.into())
    }
}
