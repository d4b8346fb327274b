use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc::{self, UnboundedReceiver},
    task::JoinHandle,
    time::timeout,
};

use crate::{
    config::Config,
    envelope::Envelope,
    error::{GustError, Result},
    manager::Manager,
    session::Session,
    transport::{MemoryPeer, MemoryTransport, Outbound, Transport},
    types::{BoxFuture, Handlers, Keys},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Connect(u64),
    Disconnect(u64),
    Message(u64, Vec<u8>),
    MessageBinary(u64, Vec<u8>),
    Sent(u64, Vec<u8>),
    SentBinary(u64, Vec<u8>),
    Pong(u64),
    LivenessFailure(u64),
    Error(u64, String),
    Close(u64, u16, String),
}

impl Event {
    pub(crate) fn is_error(&self, prefix: &str) -> bool {
        matches!(self, Event::Error(_, error) if error.starts_with(prefix))
    }
}

/// Settings that keep pings and idle timeouts out of the way.
pub(crate) fn quiet_config() -> Config {
    Config::default()
        .with_ping_period(Duration::from_secs(3600))
        .with_pong_wait(None)
}

pub(crate) async fn within<F: Future>(future: F) -> F::Output {
    timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out")
}

/// A manager whose every handler reports to the returned channel.
pub(crate) fn recording_manager(config: Config) -> (Manager, UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut manager = Manager::with_config(config);

    let events = tx.clone();
    manager.on_connect(move |session: Arc<Session>| {
        let _ = events.send(Event::Connect(session.id()));
        async {}
    });
    let events = tx.clone();
    manager.on_disconnect(move |session: Arc<Session>| {
        let _ = events.send(Event::Disconnect(session.id()));
        async {}
    });
    let events = tx.clone();
    manager.on_message(move |session: Arc<Session>, msg: Vec<u8>| {
        let _ = events.send(Event::Message(session.id(), msg));
        async {}
    });
    let events = tx.clone();
    manager.on_message_binary(move |session: Arc<Session>, msg: Vec<u8>| {
        let _ = events.send(Event::MessageBinary(session.id(), msg));
        async {}
    });
    let events = tx.clone();
    manager.on_sent(move |session: Arc<Session>, msg: Vec<u8>| {
        let _ = events.send(Event::Sent(session.id(), msg));
        async {}
    });
    let events = tx.clone();
    manager.on_sent_binary(move |session: Arc<Session>, msg: Vec<u8>| {
        let _ = events.send(Event::SentBinary(session.id(), msg));
        async {}
    });
    let events = tx.clone();
    manager.on_pong(move |session: Arc<Session>| {
        let _ = events.send(Event::Pong(session.id()));
        async {}
    });
    let events = tx.clone();
    manager.on_liveness_failure(move |session: Arc<Session>| {
        let _ = events.send(Event::LivenessFailure(session.id()));
        async {}
    });
    let events = tx.clone();
    manager.on_error(move |session: Arc<Session>, error: GustError| {
        let _ = events.send(Event::Error(session.id(), format!("{error:?}")));
        async {}
    });
    let events = tx;
    manager.on_close(move |session: Arc<Session>, code: u16, reason: String| {
        let _ = events.send(Event::Close(session.id(), code, reason));
        async { Ok::<(), GustError>(()) }
    });

    (manager, rx)
}

/// Handlers for sessions built outside a manager. Only errors and closes
/// are recorded.
pub(crate) fn recording_handlers() -> (Arc<Handlers>, UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut handlers = Handlers::default();

    let events = tx.clone();
    handlers.error = Arc::new(
        move |session: Arc<Session>, error: GustError| -> BoxFuture<()> {
            let _ = events.send(Event::Error(session.id(), format!("{error:?}")));
            Box::pin(async {})
        },
    );
    let events = tx;
    handlers.close = Some(Arc::new(
        move |session: Arc<Session>, code: u16, reason: String| -> BoxFuture<Result<()>> {
            let _ = events.send(Event::Close(session.id(), code, reason));
            Box::pin(async { Ok(()) })
        },
    ));

    (Arc::new(handlers), rx)
}

/// A session with no pumps running. Its queue is handed back so tests can
/// look at exactly what was enqueued.
pub(crate) fn detached_session(
    id: u64,
    config: &Config,
    handlers: &Arc<Handlers>,
) -> (Arc<Session>, mpsc::Receiver<Arc<Envelope>>, MemoryPeer) {
    let (transport, peer) = MemoryTransport::pair();
    let (_reader, writer) = transport.split();
    let (session, queue) = Session::new(
        id,
        None,
        None,
        Box::new(writer),
        Arc::clone(handlers),
        Arc::new(config.clone()),
    );
    (session, queue, peer)
}

pub(crate) struct Client {
    pub(crate) peer: MemoryPeer,
    pub(crate) session: Arc<Session>,
    pub(crate) intake: JoinHandle<Result<()>>,
}

impl Client {
    pub(crate) fn id(&self) -> u64 {
        self.session.id()
    }

    pub(crate) async fn recv(&mut self) -> Outbound {
        within(self.peer.recv()).await.expect("peer channel closed")
    }
}

pub(crate) async fn connect(manager: &Manager, events: &mut UnboundedReceiver<Event>) -> Client {
    connect_with_keys(manager, events, None).await
}

pub(crate) async fn connect_with_keys(
    manager: &Manager,
    events: &mut UnboundedReceiver<Event>,
    keys: Option<Keys>,
) -> Client {
    let (transport, peer) = MemoryTransport::pair();
    let intake = manager.clone();
    let task = tokio::spawn(async move { intake.handle_transport(transport, keys).await });

    let Event::Connect(id) = wait_for(events, |event| matches!(event, Event::Connect(_))).await
    else {
        panic!("expected a connect event");
    };
    let session = within(manager.sessions())
        .await
        .expect("hub is open")
        .into_iter()
        .find(|session| session.id() == id)
        .expect("session is registered");

    Client {
        peer,
        session,
        intake: task,
    }
}

pub(crate) async fn next_event(events: &mut UnboundedReceiver<Event>) -> Event {
    within(events.recv()).await.expect("event channel closed")
}

/// Skips events until one matches.
pub(crate) async fn wait_for<P>(events: &mut UnboundedReceiver<Event>, predicate: P) -> Event
where
    P: Fn(&Event) -> bool,
{
    loop {
        let event = next_event(events).await;
        if predicate(&event) {
            return event;
        }
    }
}

/// Returns every event up to and including the first match.
pub(crate) async fn collect_until<P>(
    events: &mut UnboundedReceiver<Event>,
    predicate: P,
) -> Vec<Event>
where
    P: Fn(&Event) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = predicate(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Whatever is already waiting, without blocking.
pub(crate) fn pending_events(events: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
