//! The seam between a session and the socket underneath it.
//!
//! A [`Transport`] is split once, when the session starts: the read half is
//! owned by the read loop, the write half sits behind the session's writer
//! lock. Two implementations ship with the crate:
//!
//! - [`WsTransport`] over any `tokio-tungstenite` stream.
//! - [`MemoryTransport`], an in-process pair used by tests and benchmarks.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::{envelope::MessageKind, error::TransportError};

mod memory;
mod ws;

pub use memory::{MemoryPeer, MemoryReader, MemoryTransport, MemoryWriter, Outbound};
pub use ws::{WsReader, WsTransport, WsWriter};

/// One inbound frame as seen by the read loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text message.
    Text(Vec<u8>),
    /// A binary message.
    Binary(Vec<u8>),
    /// A pong answering one of our pings.
    Pong,
}

/// A bidirectional, message oriented connection.
pub trait Transport: Send + 'static {
    /// Read half.
    type Reader: TransportReader + 'static;
    /// Write half.
    type Writer: TransportWriter + 'static;

    /// Remote address, when the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Splits the connection into independently owned halves.
    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Read half of a [`Transport`].
#[async_trait]
pub trait TransportReader: Send {
    /// Largest message the reader accepts. `0` means unlimited.
    fn set_read_limit(&mut self, limit: usize);

    /// Waits for the next data or pong frame.
    ///
    /// A close frame from the peer surfaces as [`TransportError::Closed`].
    async fn read(&mut self) -> Result<Inbound, TransportError>;
}

/// Write half of a [`Transport`].
#[async_trait]
pub trait TransportWriter: Send {
    /// Writes one text or binary frame.
    async fn write(&mut self, kind: MessageKind, payload: &[u8]) -> Result<(), TransportError>;

    /// Sends a liveness probe.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Sends a close frame and shuts the write side down.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}
