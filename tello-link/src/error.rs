use flume::RecvTimeoutError;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid video source URL")]
    InvalidVideoUrl,
    #[error("Timeout")]
    Timeout,
    #[error("Handshake refused: {0}")]
    HandshakeRefused(String),
    #[error("Could not enable the video stream after {0} attempts")]
    StreamEnableFailed(usize),
    #[error("Could not open the video source after {0} attempts")]
    StreamOpenFailed(usize),
    #[error("Operation not permitted while the session is {0}")]
    InvalidState(crate::SessionState),
    #[error("Another ack-awaiting command is already in flight")]
    CommandInFlight,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Threading error: {0:?}")]
    ChannelRecvError(flume::RecvError),
    #[error("Threading error: {0}")]
    ChannelSendError(String),
}

impl From<flume::RecvError> for Error {
    fn from(error: flume::RecvError) -> Self {
        Error::ChannelRecvError(error)
    }
}

impl<T> From<flume::SendError<T>> for Error {
    fn from(error: flume::SendError<T>) -> Self {
        Error::ChannelSendError(error.to_string())
    }
}

impl From<RecvTimeoutError> for Error {
    fn from(_error: RecvTimeoutError) -> Self {
        Error::Timeout
    }
}

impl From<url::ParseError> for Error {
    fn from(_error: url::ParseError) -> Self {
        Error::InvalidVideoUrl
    }
}
