use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{Inbound, Transport, TransportReader, TransportWriter};
use crate::{envelope::MessageKind, error::TransportError};

/// A frame written by the session side of a [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text message.
    Text(Vec<u8>),
    /// A binary message.
    Binary(Vec<u8>),
    /// A liveness probe.
    Ping,
    /// The close frame. Nothing follows it.
    Close {
        /// Close status code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

enum PeerFrame {
    Frame(Inbound),
    Close(u16, String),
}

struct Shared {
    closed: CancellationToken,
    fail_writes: AtomicBool,
    paused: watch::Sender<bool>,
}

/// In-process [`Transport`]. The other end is driven through a [`MemoryPeer`].
///
/// ## Example
///
/// ```
/// use gust::transport::{MemoryTransport, Outbound};
///
/// # async fn run(manager: gust::Manager) {
/// let (transport, mut peer) = MemoryTransport::pair();
/// tokio::spawn(async move { manager.handle_transport(transport, None).await });
///
/// peer.send_text("hello");
/// while let Some(frame) = peer.recv().await {
///     if let Outbound::Text(text) = frame {
///         println!("{}", String::from_utf8_lossy(&text));
///     }
/// }
/// # }
/// ```
pub struct MemoryTransport {
    reader: MemoryReader,
    writer: MemoryWriter,
}

/// Remote end of a [`MemoryTransport`].
pub struct MemoryPeer {
    inbound: mpsc::UnboundedSender<PeerFrame>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<Shared>,
}

/// Read half of a [`MemoryTransport`].
pub struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<PeerFrame>,
    limit: usize,
    shared: Arc<Shared>,
}

/// Write half of a [`MemoryTransport`].
pub struct MemoryWriter {
    outbound: mpsc::UnboundedSender<Outbound>,
    paused: watch::Receiver<bool>,
    shared: Arc<Shared>,
}

impl MemoryTransport {
    /// Creates a connected transport and peer.
    pub fn pair() -> (MemoryTransport, MemoryPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (paused_tx, paused_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            closed: CancellationToken::new(),
            fail_writes: AtomicBool::new(false),
            paused: paused_tx,
        });

        let transport = MemoryTransport {
            reader: MemoryReader {
                inbound: inbound_rx,
                limit: 0,
                shared: Arc::clone(&shared),
            },
            writer: MemoryWriter {
                outbound: outbound_tx,
                paused: paused_rx,
                shared: Arc::clone(&shared),
            },
        };
        let peer = MemoryPeer {
            inbound: inbound_tx,
            outbound: outbound_rx,
            shared,
        };
        (transport, peer)
    }
}

impl Transport for MemoryTransport {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (self.reader, self.writer)
    }
}

impl MemoryPeer {
    /// Sends a text message to the session.
    pub fn send_text(&self, text: impl Into<Vec<u8>>) {
        let _ = self
            .inbound
            .send(PeerFrame::Frame(Inbound::Text(text.into())));
    }

    /// Sends a binary message to the session.
    pub fn send_binary(&self, data: impl Into<Vec<u8>>) {
        let _ = self
            .inbound
            .send(PeerFrame::Frame(Inbound::Binary(data.into())));
    }

    /// Answers a ping.
    pub fn send_pong(&self) {
        let _ = self.inbound.send(PeerFrame::Frame(Inbound::Pong));
    }

    /// Sends a close frame to the session.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.inbound.send(PeerFrame::Close(code, reason.into()));
    }

    /// Drops the connection without a close frame.
    pub fn disconnect(&self) {
        self.shared.closed.cancel();
    }

    /// Makes every following write and ping fail.
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Blocks writes and pings until [`MemoryPeer::resume`] is called.
    pub fn pause(&self) {
        self.shared.paused.send_replace(true);
    }

    /// Releases writes blocked by [`MemoryPeer::pause`].
    pub fn resume(&self) {
        self.shared.paused.send_replace(false);
    }

    /// Whether either side has closed or dropped the connection.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Waits for the next frame written by the session. `None` once the
    /// write half is gone and everything has been read.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Returns a frame if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }
}

#[async_trait]
impl TransportReader for MemoryReader {
    fn set_read_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    async fn read(&mut self) -> Result<Inbound, TransportError> {
        tokio::select! {
            biased;
            frame = self.inbound.recv() => match frame {
                Some(PeerFrame::Frame(inbound)) => {
                    let size = match &inbound {
                        Inbound::Text(data) | Inbound::Binary(data) => data.len(),
                        Inbound::Pong => 0,
                    };
                    if self.limit > 0 && size > self.limit {
                        return Err(TransportError::MessageTooLarge {
                            size,
                            limit: self.limit,
                        });
                    }
                    Ok(inbound)
                }
                Some(PeerFrame::Close(code, reason)) => Err(TransportError::Closed { code, reason }),
                None => Err(TransportError::Disconnected),
            },
            _ = self.shared.closed.cancelled() => Err(TransportError::Disconnected),
        }
    }
}

impl MemoryWriter {
    async fn send(&mut self, frame: Outbound) -> Result<(), TransportError> {
        loop {
            let paused = *self.paused.borrow_and_update();
            if !paused || self.paused.changed().await.is_err() {
                break;
            }
        }
        if self.shared.closed.is_cancelled() || self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Disconnected)
    }
}

#[async_trait]
impl TransportWriter for MemoryWriter {
    async fn write(&mut self, kind: MessageKind, payload: &[u8]) -> Result<(), TransportError> {
        let frame = match kind {
            MessageKind::Text => Outbound::Text(payload.to_vec()),
            MessageKind::Binary => Outbound::Binary(payload.to_vec()),
            MessageKind::Close => {
                let reason = String::from_utf8_lossy(payload).into_owned();
                return self.close(crate::envelope::NORMAL_CLOSURE, &reason).await;
            }
        };
        self.send(frame).await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.send(Outbound::Ping).await
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.shared.closed.is_cancelled() {
            return Ok(());
        }
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_owned(),
        });
        self.shared.closed.cancel();
        Ok(())
    }
}
