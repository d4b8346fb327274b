#![cfg(feature = "bench")]

//! Internal helpers for Criterion benchmarks.
//!
//! These helpers connect in-memory sessions to a [`Manager`], so the
//! benchmarks exercise hub fan-out and the write loops without binding real
//! sockets. Every peer is drained on a background task.

use std::time::Duration;

use crate::{
    config::Config,
    manager::Manager,
    transport::{MemoryPeer, MemoryTransport},
    Broadcaster,
};

/// Context wrapping a [`Broadcaster`] whose hub holds `client_count` sessions.
pub struct BroadcastContext {
    /// Broadcaster instance that benchmarks invoke.
    pub broadcaster: Broadcaster,
}

impl BroadcastContext {
    /// Creates a context populated with `client_count` sessions.
    pub async fn with_clients(client_count: usize) -> Self {
        let config = Config::default()
            .with_message_buffer_size(4096)
            .with_ping_period(Duration::from_secs(3600))
            .with_pong_wait(None);
        let manager = Manager::with_config(config);

        for _ in 0..client_count {
            let (transport, peer) = MemoryTransport::pair();
            let intake = manager.clone();
            tokio::spawn(async move {
                let _ = intake.handle_transport(transport, None).await;
            });
            tokio::spawn(drain(peer));
        }

        while manager.len() < client_count {
            tokio::task::yield_now().await;
        }

        Self {
            broadcaster: manager.broadcaster(),
        }
    }
}

async fn drain(mut peer: MemoryPeer) {
    while peer.recv().await.is_some() {}
}
