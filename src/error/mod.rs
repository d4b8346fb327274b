//! Error types.
//!
//! [`GustError`] is what callers see, either returned from an operation
//! (`HubClosed`, `SessionClosed`) or delivered to the `on_error` handler when
//! the failure happens inside a session's read or write loop.
//! [`TransportError`] describes what went wrong on the wire and travels as the
//! source of the `Transport*` variants.

use tokio_tungstenite::tungstenite;

/// Result alias used throughout the crate.
pub type Result<T, E = GustError> = std::result::Result<T, E>;

/// Errors produced by the hub, sessions and intake.
#[derive(Debug, thiserror::Error)]
pub enum GustError {
    /// The manager has been shut down.
    #[error("hub is closed")]
    HubClosed,

    /// The session has already been closed.
    #[error("session is closed")]
    SessionClosed,

    /// A queued message reached a session after it was closed.
    #[error("tried to write to a closed session")]
    WriteToClosedSession,

    /// The session's outbound queue was full and the message was dropped.
    #[error("session message buffer is full")]
    OutputBufferFull,

    /// Reading from the transport failed.
    #[error("transport read failed: {0}")]
    TransportRead(#[source] TransportError),

    /// Writing to the transport failed.
    #[error("transport write failed: {0}")]
    TransportWrite(#[source] TransportError),

    /// Closing the transport failed.
    #[error("transport close failed: {0}")]
    TransportClose(#[source] TransportError),

    /// The server side websocket handshake failed.
    #[error("websocket handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),

    /// Configuration could not be loaded or is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] config::ConfigError),

    /// Listener level IO failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Error from the underlying websocket implementation.
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),

    /// The peer sent a close frame.
    #[error("peer closed the connection with code {code}")]
    Closed {
        /// Close code sent by the peer (1005 when the frame had none).
        code: u16,
        /// Close reason sent by the peer.
        reason: String,
    },

    /// An inbound message was larger than the configured read limit.
    #[error("message of {size} bytes exceeds the read limit of {limit} bytes")]
    MessageTooLarge {
        /// Size of the offending message.
        size: usize,
        /// The read limit in effect.
        limit: usize,
    },

    /// A text message was not valid UTF-8 and could not be framed.
    #[error("text message is not valid UTF-8")]
    InvalidText,

    /// The operation did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The connection went away without a close frame.
    #[error("connection dropped")]
    Disconnected,
}

impl TransportError {
    /// Returns the peer's close code and reason when this error is a close frame.
    pub fn close_frame(&self) -> Option<(u16, &str)> {
        match self {
            TransportError::Closed { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        }
    }
}
