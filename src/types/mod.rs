//! Handler signatures and shared aliases.
//!
//! Handlers are stored as boxed async closures, the same shape used for the
//! connection callbacks elsewhere in the crate: a plain `Fn` returning a
//! pinned, boxed future.

use std::{any::Any, collections::HashMap, future::Future, pin::Pin, sync::Arc};

use crate::{error::GustError, session::Session};

/// Boxed future returned by every handler.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A value stored in a session's key/value store.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Initial contents of a session's key/value store.
pub type Keys = HashMap<String, Value>;

/// Recipient predicate attached to a broadcast.
pub type Filter = Arc<dyn Fn(&Session) -> bool + Send + Sync>;

pub(crate) type SessionHandler = Arc<dyn Fn(Arc<Session>) -> BoxFuture<()> + Send + Sync>;

pub(crate) type MessageHandler =
    Arc<dyn Fn(Arc<Session>, Vec<u8>) -> BoxFuture<()> + Send + Sync>;

pub(crate) type ErrorHandler = Arc<dyn Fn(Arc<Session>, GustError) -> BoxFuture<()> + Send + Sync>;

pub(crate) type CloseHandler =
    Arc<dyn Fn(Arc<Session>, u16, String) -> BoxFuture<Result<(), GustError>> + Send + Sync>;

/// The full set of callbacks a manager dispatches to.
///
/// Every slot starts as an explicit no-op. `close` is the exception: `None`
/// means the built-in close routine runs without an extra user step.
#[derive(Clone)]
pub(crate) struct Handlers {
    pub(crate) connect: SessionHandler,
    pub(crate) disconnect: SessionHandler,
    pub(crate) pong: SessionHandler,
    pub(crate) liveness_failure: SessionHandler,
    pub(crate) message: MessageHandler,
    pub(crate) message_binary: MessageHandler,
    pub(crate) sent: MessageHandler,
    pub(crate) sent_binary: MessageHandler,
    pub(crate) error: ErrorHandler,
    pub(crate) close: Option<CloseHandler>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            connect: noop_session(),
            disconnect: noop_session(),
            pong: noop_session(),
            liveness_failure: noop_session(),
            message: noop_message(),
            message_binary: noop_message(),
            sent: noop_message(),
            sent_binary: noop_message(),
            error: Arc::new(|_session: Arc<Session>, _error: GustError| -> BoxFuture<()> {
                Box::pin(async {})
            }),
            close: None,
        }
    }
}

fn noop_session() -> SessionHandler {
    Arc::new(|_session: Arc<Session>| -> BoxFuture<()> { Box::pin(async {}) })
}

fn noop_message() -> MessageHandler {
    Arc::new(|_session: Arc<Session>, _msg: Vec<u8>| -> BoxFuture<()> { Box::pin(async {}) })
}
