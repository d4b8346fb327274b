//! One live connection and the two loops that drive it.
//!
//! The read loop owns the transport's read half and turns inbound frames into
//! handler calls. The write loop drains the session's bounded queue, owns the
//! ping ticker, and is the only code that writes data frames. Both converge
//! on [`Session::close_with`], which runs at most once.

use std::{any::Any, collections::HashMap, fmt, net::SocketAddr, sync::Arc};

use parking_lot::RwLock;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        Mutex,
    },
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::Config,
    envelope::{wire_close_code, Envelope, MessageKind, GOING_AWAY, NORMAL_CLOSURE},
    error::{GustError, Result, TransportError},
    transport::{Inbound, TransportReader, TransportWriter},
    types::{Handlers, Keys, Value},
};

struct State {
    open: bool,
    keys: Option<HashMap<String, Value>>,
}

enum WriteOp<'a> {
    Data(MessageKind, &'a [u8]),
    Ping,
    Close(u16, &'a str),
}

/// A live connection.
///
/// Sessions are handed to every callback as `Arc<Session>` and can be kept
/// around by the application, for example to write to a specific peer later.
/// Two sessions are equal when they have the same id.
///
/// ## Example
///
/// ```
/// use std::sync::Arc;
/// use gust::Session;
///
/// async fn greet(session: Arc<Session>) {
///     session.set("name", String::from("anonymous"));
///     let _ = session.write(format!("welcome, session {}", session.id())).await;
/// }
/// ```
pub struct Session {
    id: u64,
    addr: Option<SocketAddr>,
    state: RwLock<State>,
    outbound: mpsc::Sender<Arc<Envelope>>,
    writer: Mutex<Box<dyn TransportWriter>>,
    done: CancellationToken,
    handlers: Arc<Handlers>,
    config: Arc<Config>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        addr: Option<SocketAddr>,
        keys: Option<Keys>,
        writer: Box<dyn TransportWriter>,
        handlers: Arc<Handlers>,
        config: Arc<Config>,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<Envelope>>) {
        let (outbound, queue) = mpsc::channel(config.message_buffer_size);
        let session = Arc::new(Self {
            id,
            addr,
            state: RwLock::new(State { open: true, keys }),
            outbound,
            writer: Mutex::new(writer),
            done: CancellationToken::new(),
            handlers,
            config,
        });
        (session, queue)
    }

    /// Process-unique id, assigned in accept order.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address, when the transport knows it.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        !self.state.read().open
    }

    /// Queues a text message.
    ///
    /// The payload must be valid UTF-8. Over a websocket anything else fails
    /// the write with [`TransportError::InvalidText`] and ends the session.
    /// Never waits for queue space. A full queue drops the message and
    /// reports [`GustError::OutputBufferFull`] to the error handler.
    ///
    /// # Errors
    ///
    /// [`GustError::SessionClosed`] if the session is already closed.
    pub async fn write(self: &Arc<Self>, msg: impl Into<Vec<u8>>) -> Result<()> {
        self.submit(Envelope::text(msg)).await
    }

    /// Queues a binary message. Same rules as [`Session::write`].
    pub async fn write_binary(self: &Arc<Self>, msg: impl Into<Vec<u8>>) -> Result<()> {
        self.submit(Envelope::binary(msg)).await
    }

    /// Asks the write loop to close the connection normally.
    ///
    /// The close happens asynchronously, after the messages queued before it.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        self.submit(Envelope::close(NORMAL_CLOSURE, "")).await
    }

    /// Asks the write loop to close the connection with a code and reason.
    pub async fn close_with_reason(
        self: &Arc<Self>,
        code: u16,
        reason: impl Into<String>,
    ) -> Result<()> {
        self.submit(Envelope::close(code, reason)).await
    }

    /// Returns the value stored under `key` if it exists and has type `T`.
    pub fn get<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = self.state.read().keys.as_ref()?.get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.state
            .write()
            .keys
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), Arc::new(value));
    }

    /// Removes `key` from the store.
    pub fn unset(&self, key: &str) {
        if let Some(keys) = self.state.write().keys.as_mut() {
            keys.remove(key);
        }
    }

    /// Whether a value is stored under `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.state
            .read()
            .keys
            .as_ref()
            .is_some_and(|keys| keys.contains_key(key))
    }

    async fn submit(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(GustError::SessionClosed);
        }
        if let Err(e) = self.try_enqueue(Arc::new(envelope)) {
            self.report_error(e).await;
        }
        Ok(())
    }

    /// Pushes onto the queue without waiting. The caller decides how the
    /// failure reaches the error handler.
    pub(crate) fn try_enqueue(&self, envelope: Arc<Envelope>) -> Result<()> {
        if self.is_closed() {
            return Err(GustError::WriteToClosedSession);
        }
        match self.outbound.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(session_id = self.id, "outbound queue full, message dropped");
                Err(GustError::OutputBufferFull)
            }
            Err(TrySendError::Closed(_)) => Err(GustError::WriteToClosedSession),
        }
    }

    pub(crate) async fn report_error(self: &Arc<Self>, error: GustError) {
        (self.handlers.error)(Arc::clone(self), error).await;
    }

    async fn transmit(&self, op: WriteOp<'_>) -> std::result::Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let attempt = match op {
            WriteOp::Data(kind, payload) => writer.write(kind, payload),
            WriteOp::Ping => writer.ping(),
            WriteOp::Close(code, reason) => writer.close(code, reason),
        };
        match time::timeout(self.config.write_wait, attempt).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Closes with a normal closure and no reason.
    pub(crate) async fn close_now(self: &Arc<Self>) {
        self.close_with(NORMAL_CLOSURE, String::new()).await;
    }

    /// The one close routine. Only the first caller gets past the state flip.
    pub(crate) async fn close_with(self: &Arc<Self>, code: u16, reason: String) {
        {
            let mut state = self.state.write();
            if !state.open {
                return;
            }
            state.open = false;
        }

        if let Err(e) = self
            .transmit(WriteOp::Close(wire_close_code(code), &reason))
            .await
        {
            warn!(session_id = self.id, error = %e, "failed to close transport");
            self.report_error(GustError::TransportClose(e)).await;
        }
        self.done.cancel();
        debug!(session_id = self.id, code, "session closed");

        if let Some(on_close) = &self.handlers.close {
            if let Err(e) = on_close(Arc::clone(self), code, reason).await {
                self.report_error(e).await;
            }
        }
    }

    /// Closes a session that never made it into the hub. No callbacks run.
    pub(crate) async fn discard(&self) {
        {
            let mut state = self.state.write();
            if !state.open {
                return;
            }
            state.open = false;
        }
        if let Err(e) = self.transmit(WriteOp::Close(GOING_AWAY, "")).await {
            debug!(session_id = self.id, error = %e, "failed to close unregistered transport");
        }
        self.done.cancel();
    }

    pub(crate) async fn write_pump(self: Arc<Self>, mut queue: mpsc::Receiver<Arc<Envelope>>) {
        let period = self.config.ping_period;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.done.cancelled() => break,
                envelope = queue.recv() => {
                    let Some(envelope) = envelope else { break };
                    let kind = envelope.kind();
                    if kind == MessageKind::Close {
                        self.close_with(envelope.close_code(), envelope.close_reason())
                            .await;
                        break;
                    }
                    if let Err(e) = self.transmit(WriteOp::Data(kind, envelope.payload())).await {
                        debug!(session_id = self.id, error = %e, "write failed");
                        if !self.is_closed() {
                            self.report_error(GustError::TransportWrite(e)).await;
                        }
                        break;
                    }
                    let sent = match kind {
                        MessageKind::Binary => &self.handlers.sent_binary,
                        _ => &self.handlers.sent,
                    };
                    sent(Arc::clone(&self), envelope.payload().to_vec()).await;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.transmit(WriteOp::Ping).await {
                        debug!(session_id = self.id, error = %e, "ping failed");
                        (self.handlers.liveness_failure)(Arc::clone(&self)).await;
                    }
                }
            }
        }

        debug!(session_id = self.id, "write loop exited");
        self.close_now().await;
    }

    /// Runs until the transport fails or the session is closed. Returns the
    /// peer's close code and reason when the connection ended with a close
    /// frame from the peer.
    pub(crate) async fn read_pump<R>(self: &Arc<Self>, mut reader: R) -> Option<(u16, String)>
    where
        R: TransportReader,
    {
        reader.set_read_limit(self.config.max_message_size);

        loop {
            let read = tokio::select! {
                biased;
                _ = self.done.cancelled() => None,
                read = self.next_inbound(&mut reader) => Some(read),
            };
            let Some(read) = read else {
                self.await_close_echo(&mut reader).await;
                return None;
            };

            match read {
                Ok(Inbound::Text(data)) => self.dispatch(MessageKind::Text, data).await,
                Ok(Inbound::Binary(data)) => self.dispatch(MessageKind::Binary, data).await,
                Ok(Inbound::Pong) => (self.handlers.pong)(Arc::clone(self)).await,
                Err(e) => {
                    let peer_close = e
                        .close_frame()
                        .map(|(code, reason)| (code, reason.to_owned()));
                    debug!(session_id = self.id, error = %e, "read loop exited");
                    // Our own close tears the transport down; that is not a failure.
                    if !self.is_closed() {
                        self.report_error(GustError::TransportRead(e)).await;
                    }
                    return peer_close;
                }
            }
        }
    }

    async fn next_inbound<R>(&self, reader: &mut R) -> std::result::Result<Inbound, TransportError>
    where
        R: TransportReader,
    {
        match self.config.pong_wait {
            Some(wait) => match time::timeout(wait, reader.read()).await {
                Ok(read) => read,
                Err(_) => Err(TransportError::Timeout),
            },
            None => reader.read().await,
        }
    }

    /// After our close frame went out, gives the peer `write_wait` to answer
    /// it. Frames arriving in the meantime are discarded.
    async fn await_close_echo<R>(&self, reader: &mut R)
    where
        R: TransportReader,
    {
        let drain = async {
            loop {
                if let Err(e) = reader.read().await {
                    return e;
                }
            }
        };
        match time::timeout(self.config.write_wait, drain).await {
            Ok(e) => debug!(session_id = self.id, error = %e, "read loop exited after close"),
            Err(_) => debug!(session_id = self.id, "peer did not answer close, read loop exited"),
        }
    }

    async fn dispatch(self: &Arc<Self>, kind: MessageKind, data: Vec<u8>) {
        let handler = match kind {
            MessageKind::Binary => &self.handlers.message_binary,
            _ => &self.handlers.message,
        };
        let handled = handler(Arc::clone(self), data);
        if self.config.concurrent_message_handling {
            tokio::spawn(handled);
        } else {
            handled.await;
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
