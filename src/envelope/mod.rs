//! Outbound units of work.
//!
//! An [`Envelope`] is built once, wrapped in an `Arc` and then shared by every
//! session queue it is pushed into. Nothing mutates it after that point.

use std::{fmt, sync::Arc};

use crate::{session::Session, types::Filter};

/// Normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// The endpoint is going away, e.g. a server shutting down.
pub const GOING_AWAY: u16 = 1001;

/// Reported when a close frame carried no status code. Never sent on the wire.
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Kind of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text frame.
    Text,
    /// Binary frame.
    Binary,
    /// Close handshake. The payload is the close reason.
    Close,
}

/// One outbound message, optionally restricted to matching recipients.
pub struct Envelope {
    kind: MessageKind,
    payload: Vec<u8>,
    filter: Option<Filter>,
    close_code: u16,
}

impl Envelope {
    /// Creates a text envelope.
    pub fn text(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Text, payload.into())
    }

    /// Creates a binary envelope.
    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Binary, payload.into())
    }

    /// Creates a close envelope carrying a status code and reason.
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self {
            close_code: code,
            ..Self::new(MessageKind::Close, reason.into().into_bytes())
        }
    }

    fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self {
            kind,
            payload,
            filter: None,
            close_code: NORMAL_CLOSURE,
        }
    }

    /// Restricts delivery to sessions for which `filter` returns `true`.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Session) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// The message kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// The raw payload. For close envelopes this is the reason.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Close status code. Only meaningful for [`MessageKind::Close`].
    pub fn close_code(&self) -> u16 {
        self.close_code
    }

    /// Close reason decoded as UTF-8.
    pub fn close_reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Whether this envelope should be delivered to `session`.
    pub fn matches(&self, session: &Session) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(session))
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("kind", &self.kind)
            .field("len", &self.payload.len())
            .field("filtered", &self.filter.is_some())
            .field("close_code", &self.close_code)
            .finish()
    }
}

/// Maps codes that must not appear in a close frame to a normal closure.
pub(crate) fn wire_close_code(code: u16) -> u16 {
    match code {
        1005 | 1006 | 1015 => NORMAL_CLOSURE,
        code if code < 1000 => NORMAL_CLOSURE,
        code => code,
    }
}
