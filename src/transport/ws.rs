use std::net::SocketAddr;

use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    tungstenite::{
        self,
        error::ProtocolError,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    WebSocketStream,
};

use super::{Inbound, Transport, TransportReader, TransportWriter};
use crate::{
    envelope::{MessageKind, NO_STATUS_RECEIVED},
    error::TransportError,
};

/// [`Transport`] over a `tokio-tungstenite` websocket stream.
///
/// Works for any already upgraded stream, whether it came from
/// `accept_async`, an HTTP upgrade or a client connect.
pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
    addr: Option<SocketAddr>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an upgraded stream with no known peer address.
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream, addr: None }
    }

    /// Wraps an upgraded stream and records the peer address.
    pub fn with_addr(stream: WebSocketStream<S>, addr: SocketAddr) -> Self {
        Self {
            stream,
            addr: Some(addr),
        }
    }
}

impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Reader = WsReader<S>;
    type Writer = WsWriter<S>;

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = self.stream.split();
        (WsReader { stream, limit: 0 }, WsWriter { sink })
    }
}

/// Read half of a [`WsTransport`].
pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
    limit: usize,
}

/// Write half of a [`WsTransport`].
pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> WsReader<S> {
    fn check_limit(&self, size: usize) -> Result<(), TransportError> {
        if self.limit > 0 && size > self.limit {
            return Err(TransportError::MessageTooLarge {
                size,
                limit: self.limit,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<S> TransportReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn set_read_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    async fn read(&mut self) -> Result<Inbound, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_limit(text.len())?;
                    return Ok(Inbound::Text(text.as_bytes().to_vec()));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.check_limit(data.len())?;
                    return Ok(Inbound::Binary(data.to_vec()));
                }
                Some(Ok(Message::Pong(_))) => return Ok(Inbound::Pong),
                // tungstenite answers pings on the next write or flush.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                        None => (NO_STATUS_RECEIVED, String::new()),
                    };
                    return Err(TransportError::Closed { code, reason });
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(TransportError::Disconnected),
            }
        }
    }
}

#[async_trait]
impl<S> TransportWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write(&mut self, kind: MessageKind, payload: &[u8]) -> Result<(), TransportError> {
        let message = match kind {
            MessageKind::Text => {
                let text =
                    String::from_utf8(payload.to_vec()).map_err(|_| TransportError::InvalidText)?;
                Message::Text(text.into())
            }
            MessageKind::Binary => Message::Binary(payload.to_vec().into()),
            MessageKind::Close => {
                let reason = String::from_utf8_lossy(payload);
                return self.close(crate::envelope::NORMAL_CLOSURE, &reason).await;
            }
        };
        self.sink.send(message).await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.sink.send(Message::Ping(Vec::new().into())).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        match self.sink.send(Message::Close(Some(frame))).await {
            Ok(()) => {}
            Err(e) if already_closed(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        match self.sink.close().await {
            Ok(()) => Ok(()),
            Err(e) if already_closed(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn already_closed(error: &tungstenite::Error) -> bool {
    matches!(
        error,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Protocol(ProtocolError::SendAfterClosing)
    )
}
