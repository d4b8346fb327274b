//! # gust
//!
//! A websocket session hub for Tokio.
//!
//! `gust` keeps track of every live connection and broadcasts to all of them,
//! or to any filtered subset, without letting one slow peer hold up the rest.
//! Each session gets a bounded outbound queue. When it is full the message is
//! dropped for that session only and the drop is reported to `on_error`.
//!
//! ## Features
//!
//! - **Hub**: registration, broadcast and shutdown go through a single task
//! - **Backpressure**: full queues drop and report instead of blocking
//! - **Liveness**: periodic pings and an idle read deadline
//! - **Transports**: `tokio-tungstenite` streams or the in-memory pair
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
//!     manager.on_connect(|session: Arc<Session>| async move {
//!         let _ = session.write("welcome").await;
//!     });
//!
//!     manager.on_message(move |_session: Arc<Session>, msg: Vec<u8>| {
//!         let broadcaster = broadcaster.clone();
//!         async move {
//!             let _ = broadcaster.broadcast(msg).await;
//!         }
//!     });
//!
//!     manager.listen("0.0.0.0:5000").await
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod envelope;
pub mod error;
mod hub;
pub mod manager;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(feature = "bench")]
pub mod bench_support;

#[cfg(test)]
mod tests;

pub use broadcast::Broadcaster;
pub use config::Config;
pub use envelope::{Envelope, MessageKind, GOING_AWAY, NORMAL_CLOSURE};
pub use error::{GustError, Result, TransportError};
pub use manager::Manager;
pub use session::Session;
