use std::sync::Arc;

use gust::{Config, GustError, Manager, Session, GOING_AWAY};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,gust=debug".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> gust::Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    let addr = std::env::var("GUST_ADDR").unwrap_or_else(|_| "0.0.0.0:5000".to_string());

    let mut manager = Manager::with_config(config);
    let broadcaster = manager.broadcaster();

    manager.on_connect(|session: Arc<Session>| async move {
        info!(session_id = session.id(), addr = ?session.addr(), "client connected");
    });

    manager.on_message(move |_session: Arc<Session>, msg: Vec<u8>| {
        let broadcaster = broadcaster.clone();
        async move {
            let _ = broadcaster.broadcast(msg).await;
        }
    });

    manager.on_error(|session: Arc<Session>, error: GustError| async move {
        warn!(session_id = session.id(), %error, "session error");
    });

    manager.on_disconnect(|session: Arc<Session>| async move {
        info!(session_id = session.id(), "client disconnected");
    });

    tokio::select! {
        served = manager.listen(addr.as_str()) => served,
        _ = tokio::signal::ctrl_c() => {
            info!(live = manager.len(), "shutting down");
            manager.shutdown_with(GOING_AWAY, "server shutting down").await
        }
    }
}
