//! Fan-out helpers.
//!
//! A [`Broadcaster`] is a cloneable handle to the hub that only knows how to
//! send. Handlers usually capture one instead of the whole manager.

use std::sync::Arc;

use crate::{
    envelope::Envelope,
    error::Result,
    hub::Hub,
    session::Session,
};

/// Sends messages to many sessions at once.
///
/// Every method only hands the message to the hub, which pushes it onto each
/// recipient's queue without waiting. Recipients with a full queue miss the
/// message and get an [`OutputBufferFull`](crate::GustError::OutputBufferFull)
/// report.
///
/// ## Example
///
/// ```
/// use std::sync::Arc;
/// use gust::{Manager, Session};
///
/// # async fn run() {
/// let mut manager = Manager::new();
/// let broadcaster = manager.broadcaster();
///
/// manager.on_message(move |session: Arc<Session>, msg: Vec<u8>| {
///     let broadcaster = broadcaster.clone();
///     async move {
///         let _ = broadcaster.broadcast_others(msg, &session).await;
///     }
/// });
/// # }
/// ```
#[derive(Clone)]
pub struct Broadcaster {
    pub(crate) hub: Hub,
}

impl Broadcaster {
    /// Sends a text message to every session.
    ///
    /// # Errors
    ///
    /// [`HubClosed`](crate::GustError::HubClosed) after shutdown.
    pub async fn broadcast(&self, msg: impl Into<Vec<u8>>) -> Result<()> {
        self.hub.broadcast(Envelope::text(msg)).await
    }

    /// Sends a binary message to every session.
    pub async fn broadcast_binary(&self, msg: impl Into<Vec<u8>>) -> Result<()> {
        self.hub.broadcast(Envelope::binary(msg)).await
    }

    /// Sends a text message to every session for which `filter` returns `true`.
    pub async fn broadcast_filter<F>(&self, msg: impl Into<Vec<u8>>, filter: F) -> Result<()>
    where
        F: Fn(&Session) -> bool + Send + Sync + 'static,
    {
        self.hub
            .broadcast(Envelope::text(msg).with_filter(filter))
            .await
    }

    /// Sends a binary message to every session for which `filter` returns `true`.
    pub async fn broadcast_binary_filter<F>(
        &self,
        msg: impl Into<Vec<u8>>,
        filter: F,
    ) -> Result<()>
    where
        F: Fn(&Session) -> bool + Send + Sync + 'static,
    {
        self.hub
            .broadcast(Envelope::binary(msg).with_filter(filter))
            .await
    }

    /// Sends a text message to every session except `except`.
    pub async fn broadcast_others(&self, msg: impl Into<Vec<u8>>, except: &Session) -> Result<()> {
        let id = except.id();
        self.broadcast_filter(msg, move |session| session.id() != id)
            .await
    }

    /// Sends a binary message to every session except `except`.
    pub async fn broadcast_binary_others(
        &self,
        msg: impl Into<Vec<u8>>,
        except: &Session,
    ) -> Result<()> {
        let id = except.id();
        self.broadcast_binary_filter(msg, move |session| session.id() != id)
            .await
    }

    /// Writes a text message to each of `sessions` directly, bypassing the hub.
    ///
    /// # Errors
    ///
    /// Stops at the first session that refuses the write, usually with
    /// [`SessionClosed`](crate::GustError::SessionClosed).
    pub async fn broadcast_multiple(
        &self,
        msg: impl Into<Vec<u8>>,
        sessions: &[Arc<Session>],
    ) -> Result<()> {
        let msg = msg.into();
        for session in sessions {
            session.write(msg.clone()).await?;
        }
        Ok(())
    }
}
