use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::session::SessionId;

/// Failures while reading or writing length-prefixed frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The peer went away mid-frame, or the session was already closed.
    #[error("transport closed")]
    TransportClosed,

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("frame exceeds the {max} byte limit")]
    FrameTooLarge { max: usize },

    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

impl FrameError {
    /// Routine disconnects are logged quietly; everything else is a protocol
    /// or I/O fault worth a warning.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::TransportClosed => true,
            FrameError::Transport(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} is already registered")]
    DuplicateId(SessionId),

    #[error("session {0} is not registered")]
    NotFound(SessionId),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}
