//! The public entry point.
//!
//! A [`Manager`] owns the hub, the configuration and the handler set. Build
//! one, register handlers, then feed it connections through one of the
//! intake methods or let [`Manager::listen`] accept them.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gust::{Manager, Session};
//!
//! #[tokio::main]
//! async fn main() -> gust::Result<()> {
//!     let mut manager = Manager::new();
//!     let broadcaster = manager.broadcaster();
//!
//!     manager.on_message(move |_session: Arc<Session>, msg: Vec<u8>| {
//!         let broadcaster = broadcaster.clone();
//!         async move {
//!             let _ = broadcaster.broadcast(msg).await;
//!         }
//!     });
//!
//!     manager.listen("127.0.0.1:5000").await
//! }
//! ```

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, ToSocketAddrs},
};
use tokio_tungstenite::{
    accept_async_with_config, tungstenite::protocol::WebSocketConfig, WebSocketStream,
};
use tracing::{debug, info};

use crate::{
    broadcast::Broadcaster,
    config::Config,
    envelope::{Envelope, NORMAL_CLOSURE},
    error::{GustError, Result},
    hub::Hub,
    session::Session,
    transport::{Transport, WsTransport},
    types::{BoxFuture, Handlers, Keys},
};

/// Accepts connections, dispatches their events and broadcasts to them.
///
/// Cloning is cheap and every clone drives the same hub. Handlers should be
/// registered before the manager is cloned or starts accepting; sessions
/// keep the handler set that was current when they were accepted.
#[derive(Clone)]
pub struct Manager {
    hub: Hub,
    handlers: Arc<Handlers>,
    config: Arc<Config>,
    next_id: Arc<AtomicU64>,
}

impl Manager {
    /// Creates a manager with the default [`Config`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime, since the hub task is
    /// spawned right away.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a manager with the given settings.
    ///
    /// Zero buffer sizes and a zero ping period are raised to the smallest
    /// usable value. Same runtime requirement as [`Manager::new`].
    pub fn with_config(config: Config) -> Self {
        let config = config.sanitized();
        Self {
            hub: Hub::spawn(config.hub_buffer_size),
            handlers: Arc::new(Handlers::default()),
            config: Arc::new(config),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// The settings in effect.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn handlers_mut(&mut self) -> &mut Handlers {
        Arc::make_mut(&mut self.handlers)
    }

    /// Called once a session is registered, before its first read.
    pub fn on_connect<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers_mut().connect =
            Arc::new(move |session: Arc<Session>| -> BoxFuture<()> { Box::pin(handler(session)) });
    }

    /// Called after a session has been unregistered and closed.
    pub fn on_disconnect<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers_mut().disconnect =
            Arc::new(move |session: Arc<Session>| -> BoxFuture<()> { Box::pin(handler(session)) });
    }

    /// Called for every pong received.
    pub fn on_pong<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers_mut().pong =
            Arc::new(move |session: Arc<Session>| -> BoxFuture<()> { Box::pin(handler(session)) });
    }

    /// Called when a ping could not be written. The session stays open.
    pub fn on_liveness_failure<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<Session>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers_mut().liveness_failure =
            Arc::new(move |session: Arc<Session>| -> BoxFuture<()> { Box::pin(handler(session)) });
    }

    /// Called for every inbound text message.
    pub fn on_message<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<Session>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers_mut().message =
            Arc::new(move |session: Arc<Session>, msg: Vec<u8>| -> BoxFuture<()> {
                Box::pin(handler(session, msg))
            });
    }

    /// Called for every inbound binary message.
    pub fn on_message_binary<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<Session>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers_mut().message_binary =
            Arc::new(move |session: Arc<Session>, msg: Vec<u8>| -> BoxFuture<()> {
                Box::pin(handler(session, msg))
            });
    }

    /// Called after a text message has been written to the transport.
    pub fn on_sent<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<Session>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers_mut().sent =
            Arc::new(move |session: Arc<Session>, msg: Vec<u8>| -> BoxFuture<()> {
                Box::pin(handler(session, msg))
            });
    }

    /// Called after a binary message has been written to the transport.
    pub fn on_sent_binary<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<Session>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers_mut().sent_binary =
            Arc::new(move |session: Arc<Session>, msg: Vec<u8>| -> BoxFuture<()> {
                Box::pin(handler(session, msg))
            });
    }

    /// Called for failures that happen away from any caller: full queues,
    /// transport errors and close handler errors.
    pub fn on_error<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<Session>, GustError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers_mut().error =
            Arc::new(move |session: Arc<Session>, error: GustError| -> BoxFuture<()> {
                Box::pin(handler(session, error))
            });
    }

    /// Called exactly once per session with the close code and reason, after
    /// the close frame has been sent. An `Err` is passed on to the error
    /// handler.
    pub fn on_close<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<Session>, u16, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers_mut().close = Some(Arc::new(
            move |session: Arc<Session>, code: u16, reason: String| -> BoxFuture<Result<()>> {
                Box::pin(handler(session, code, reason))
            },
        ));
    }

    /// Runs a connection to completion.
    ///
    /// Registers a session, calls the connect handler, starts the write loop
    /// and reads on the current task until the transport fails. The session
    /// is then unregistered and closed, and the disconnect handler runs last.
    ///
    /// # Errors
    ///
    /// [`GustError::HubClosed`] when the manager has been shut down.
    pub async fn handle_transport<T>(&self, transport: T, keys: Option<Keys>) -> Result<()>
    where
        T: Transport,
    {
        if self.hub.is_closed() {
            return Err(GustError::HubClosed);
        }

        let addr = transport.peer_addr();
        let (reader, writer) = transport.split();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (session, queue) = Session::new(
            id,
            addr,
            keys,
            Box::new(writer),
            Arc::clone(&self.handlers),
            Arc::clone(&self.config),
        );

        if self.hub.register(Arc::clone(&session)).await.is_err() {
            session.discard().await;
            return Err(GustError::HubClosed);
        }

        (self.handlers.connect)(Arc::clone(&session)).await;
        let write_loop = tokio::spawn(Arc::clone(&session).write_pump(queue));

        let peer_close = session.read_pump(reader).await;

        let _ = self.hub.unregister(session.id()).await;
        match peer_close {
            Some((code, reason)) => session.close_with(code, reason).await,
            None => session.close_now().await,
        }
        let _ = write_loop.await;
        (self.handlers.disconnect)(Arc::clone(&session)).await;
        Ok(())
    }

    /// Runs an already upgraded websocket stream.
    pub async fn handle_upgraded<S>(&self, stream: WebSocketStream<S>, keys: Option<Keys>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.handle_transport(WsTransport::new(stream), keys).await
    }

    /// Performs the server side websocket handshake on `io`, then runs it.
    ///
    /// # Errors
    ///
    /// [`GustError::Handshake`] if the handshake fails, otherwise as
    /// [`Manager::handle_transport`].
    pub async fn handle_stream<S>(&self, io: S, keys: Option<Keys>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.upgrade(io, None, keys).await
    }

    async fn upgrade<S>(&self, io: S, addr: Option<SocketAddr>, keys: Option<Keys>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.hub.is_closed() {
            return Err(GustError::HubClosed);
        }
        let ws_config =
            WebSocketConfig::default().max_message_size(Some(self.config.max_message_size));
        let stream = accept_async_with_config(io, Some(ws_config))
            .await
            .map_err(GustError::Handshake)?;
        let transport = match addr {
            Some(addr) => WsTransport::with_addr(stream, addr),
            None => WsTransport::new(stream),
        };
        self.handle_transport(transport, keys).await
    }

    /// Binds `addr` and serves websocket connections on it.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "listening");
        self.serve(listener).await
    }

    /// Accepts connections from `listener`, each on its own task.
    ///
    /// Returns `Ok(())` once the manager has been shut down.
    ///
    /// # Errors
    ///
    /// [`GustError::Io`] if accepting fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let stopped = self.hub.stopped();
        loop {
            tokio::select! {
                biased;
                _ = stopped.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    let manager = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = manager.upgrade(stream, Some(addr), None).await {
                            debug!(%addr, error = %e, "connection rejected");
                        }
                    });
                }
            }
        }
    }

    /// A cloneable handle that can only broadcast.
    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster {
            hub: self.hub.clone(),
        }
    }

    /// See [`Broadcaster::broadcast`].
    pub async fn broadcast(&self, msg: impl Into<Vec<u8>>) -> Result<()> {
        self.broadcaster().broadcast(msg).await
    }

    /// See [`Broadcaster::broadcast_binary`].
    pub async fn broadcast_binary(&self, msg: impl Into<Vec<u8>>) -> Result<()> {
        self.broadcaster().broadcast_binary(msg).await
    }

    /// See [`Broadcaster::broadcast_filter`].
    pub async fn broadcast_filter<F>(&self, msg: impl Into<Vec<u8>>, filter: F) -> Result<()>
    where
        F: Fn(&Session) -> bool + Send + Sync + 'static,
    {
        self.broadcaster().broadcast_filter(msg, filter).await
    }

    /// See [`Broadcaster::broadcast_binary_filter`].
    pub async fn broadcast_binary_filter<F>(
        &self,
        msg: impl Into<Vec<u8>>,
        filter: F,
    ) -> Result<()>
    where
        F: Fn(&Session) -> bool + Send + Sync + 'static,
    {
        self.broadcaster().broadcast_binary_filter(msg, filter).await
    }

    /// See [`Broadcaster::broadcast_others`].
    pub async fn broadcast_others(&self, msg: impl Into<Vec<u8>>, except: &Session) -> Result<()> {
        self.broadcaster().broadcast_others(msg, except).await
    }

    /// See [`Broadcaster::broadcast_binary_others`].
    pub async fn broadcast_binary_others(
        &self,
        msg: impl Into<Vec<u8>>,
        except: &Session,
    ) -> Result<()> {
        self.broadcaster().broadcast_binary_others(msg, except).await
    }

    /// See [`Broadcaster::broadcast_multiple`].
    pub async fn broadcast_multiple(
        &self,
        msg: impl Into<Vec<u8>>,
        sessions: &[Arc<Session>],
    ) -> Result<()> {
        self.broadcaster().broadcast_multiple(msg, sessions).await
    }

    /// Snapshot of the live sessions, in accept order.
    ///
    /// # Errors
    ///
    /// [`GustError::HubClosed`] after shutdown.
    pub async fn sessions(&self) -> Result<Vec<Arc<Session>>> {
        self.hub.sessions().await
    }

    /// Number of live sessions. `0` after shutdown.
    pub fn len(&self) -> usize {
        self.hub.len()
    }

    /// Whether there are no live sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`Manager::shutdown`] has been called.
    pub fn is_closed(&self) -> bool {
        self.hub.is_closed()
    }

    /// Closes every session with a normal closure and stops the hub.
    ///
    /// # Errors
    ///
    /// [`GustError::HubClosed`] if already shut down.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with(NORMAL_CLOSURE, "").await
    }

    /// Closes every session with `code` and `reason` and stops the hub.
    pub async fn shutdown_with(&self, code: u16, reason: impl Into<String>) -> Result<()> {
        self.hub
            .shutdown(Envelope::close(code, reason))
            .await
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}
