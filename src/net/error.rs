use std::io;

use quinn::{ConnectError, ConnectionError, ReadError, ReadExactError, WriteError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The remote side closed the connection cleanly.
    #[error("connection closed by remote")]
    Eof,
    /// The connection was closed locally.
    #[error("connection closed")]
    Closed,
    #[error("payload of {0} bytes does not fit in a frame")]
    FrameTooLarge(usize),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("node rejected: {0}")]
    Rejected(String),
    #[error("already connected: {0}")]
    Duplicate(String),
    #[error("not connected: {0}")]
    NotConnected(String),
    #[error("heartbeat timed out")]
    HeartbeatTimeout,
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid origin: {0}")]
    InvalidOrigin(String),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    ReadExact(#[from] ReadExactError),
    #[error(transparent)]
    Tls(#[from] rustls::Error),
    #[error(transparent)]
    Certificate(#[from] rcgen::RcgenError),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether the error just means the remote went away.
    pub fn is_eof(&self) -> bool {
        match self {
            Error::Eof => true,
            Error::Io(e) => e.kind() == io::ErrorKind::UnexpectedEof,
            Error::ReadExact(ReadExactError::FinishedEarly) => true,
            Error::WebSocket(
                tokio_tungstenite::tungstenite::Error::ConnectionClosed,
            ) => true,
            _ => false,
        }
    }
}
