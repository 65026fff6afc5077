//! Error types for connection handling.

use crate::codec::CodecError;
use crate::dial::DialError;
use std::error::Error;
use std::fmt;
use std::io;

/// Errors that can occur during peer connection establishment and communication.
#[derive(Debug)]
pub enum ConnectionError {
    /// An I/O error occurred during network operations.
    Io(io::Error),
    /// The framing layer failed; the session cannot continue on this stream.
    Codec(CodecError),
    /// The transport could not produce a stream to the peer.
    Dial(DialError),
    /// A single-message read deadline lapsed.
    MessageTimeout,
    /// Detected a connection loop (attempting to connect to ourselves).
    ///
    /// Possible causes:
    ///
    /// * Local node's address appears in a peer's address list.
    /// * Port forwarding issues cause external connections to loopback.
    ConnectionLoop,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(err) => write!(f, "Connection error: {err}"),
            ConnectionError::Codec(err) => {
                write!(f, "Framing failed in peer connection: {err}")
            }
            ConnectionError::Dial(err) => write!(f, "Could not reach peer: {err}"),
            ConnectionError::MessageTimeout => write!(f, "Timed out waiting for a message"),
            ConnectionError::ConnectionLoop => {
                write!(f, "Detected connection to self (matching nonce)")
            }
        }
    }
}

impl Error for ConnectionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConnectionError::Io(err) => Some(err),
            ConnectionError::Codec(err) => Some(err),
            ConnectionError::Dial(err) => Some(err),
            ConnectionError::MessageTimeout => None,
            ConnectionError::ConnectionLoop => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::Io(err)
    }
}

impl From<CodecError> for ConnectionError {
    fn from(err: CodecError) -> Self {
        ConnectionError::Codec(err)
    }
}

impl From<DialError> for ConnectionError {
    fn from(err: DialError) -> Self {
        ConnectionError::Dial(err)
    }
}
