//! The session registry.
//!
//! A single task owns the live set and processes [`HubEvent`]s in arrival
//! order. Everything else talks to it through a bounded channel, and reads
//! `closed` and `len` from atomics the task keeps current.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    envelope::Envelope,
    error::{GustError, Result},
    session::Session,
};

pub(crate) enum HubEvent {
    Register(Arc<Session>),
    Unregister(u64),
    Broadcast(Arc<Envelope>),
    Shutdown(Arc<Envelope>),
    Snapshot(oneshot::Sender<Vec<Arc<Session>>>),
}

struct HubState {
    closed: AtomicBool,
    len: AtomicUsize,
    stopped: CancellationToken,
}

/// Cheap, cloneable handle to the registry task.
#[derive(Clone)]
pub(crate) struct Hub {
    events: mpsc::Sender<HubEvent>,
    state: Arc<HubState>,
}

impl Hub {
    /// Starts the registry task. Must be called inside a Tokio runtime.
    pub(crate) fn spawn(buffer: usize) -> Self {
        let (events, receiver) = mpsc::channel(buffer);
        let state = Arc::new(HubState {
            closed: AtomicBool::new(false),
            len: AtomicUsize::new(0),
            stopped: CancellationToken::new(),
        });
        tokio::spawn(run(receiver, Arc::clone(&state)));
        Self { events, state }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Live session count. Reads as zero as soon as shutdown has been requested.
    pub(crate) fn len(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.state.len.load(Ordering::SeqCst)
    }

    /// Fires once the registry task has stopped.
    pub(crate) fn stopped(&self) -> CancellationToken {
        self.state.stopped.clone()
    }

    pub(crate) async fn register(&self, session: Arc<Session>) -> Result<()> {
        self.send(HubEvent::Register(session)).await
    }

    pub(crate) async fn unregister(&self, id: u64) -> Result<()> {
        self.send(HubEvent::Unregister(id)).await
    }

    pub(crate) async fn broadcast(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(GustError::HubClosed);
        }
        self.send(HubEvent::Broadcast(Arc::new(envelope))).await
    }

    pub(crate) async fn sessions(&self) -> Result<Vec<Arc<Session>>> {
        if self.is_closed() {
            return Err(GustError::HubClosed);
        }
        let (reply, response) = oneshot::channel();
        self.send(HubEvent::Snapshot(reply)).await?;
        response.await.map_err(|_| GustError::HubClosed)
    }

    /// Marks the hub closed and hands `envelope` to every live session.
    pub(crate) async fn shutdown(&self, envelope: Envelope) -> Result<()> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Err(GustError::HubClosed);
        }
        self.send(HubEvent::Shutdown(Arc::new(envelope))).await
    }

    async fn send(&self, event: HubEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| GustError::HubClosed)
    }
}

async fn run(mut events: mpsc::Receiver<HubEvent>, state: Arc<HubState>) {
    let mut sessions: BTreeMap<u64, Arc<Session>> = BTreeMap::new();
    let mut farewell = None;

    while let Some(event) = events.recv().await {
        match event {
            HubEvent::Register(session) => {
                debug!(session_id = session.id(), "session registered");
                sessions.insert(session.id(), session);
                state.len.store(sessions.len(), Ordering::SeqCst);
            }
            HubEvent::Unregister(id) => {
                if sessions.remove(&id).is_some() {
                    debug!(session_id = id, "session unregistered");
                    state.len.store(sessions.len(), Ordering::SeqCst);
                }
            }
            HubEvent::Broadcast(envelope) => {
                let delivered = fan_out(&sessions, &envelope);
                debug!(delivered, live = sessions.len(), "broadcast dispatched");
            }
            HubEvent::Snapshot(reply) => {
                let _ = reply.send(sessions.values().cloned().collect());
            }
            HubEvent::Shutdown(envelope) => {
                let mut failures = Vec::new();
                for session in sessions.values().filter(|session| !session.is_closed()) {
                    if let Err(e) = session.try_enqueue(Arc::clone(&envelope)) {
                        spawn_close(session, &envelope);
                        failures.push((Arc::clone(session), e));
                    }
                }
                spawn_reports(failures);
                debug!(live = sessions.len(), "hub shut down");
                sessions.clear();
                farewell = Some(envelope);
                break;
            }
        }
    }

    state.closed.store(true, Ordering::SeqCst);
    state.len.store(0, Ordering::SeqCst);

    // Registrations that raced with shutdown are closed the same way.
    events.close();
    while let Some(event) = events.recv().await {
        if let (HubEvent::Register(session), Some(envelope)) = (event, farewell.as_ref()) {
            spawn_close(&session, envelope);
        }
    }
    state.stopped.cancel();
}

fn fan_out(sessions: &BTreeMap<u64, Arc<Session>>, envelope: &Arc<Envelope>) -> usize {
    let mut delivered = 0;
    let mut failures = Vec::new();
    for session in sessions.values() {
        if !envelope.matches(session) {
            continue;
        }
        match session.try_enqueue(Arc::clone(envelope)) {
            Ok(()) => delivered += 1,
            Err(e) => failures.push((Arc::clone(session), e)),
        }
    }
    spawn_reports(failures);
    delivered
}

/// Reports one dispatch's failures in session order from a single task.
fn spawn_reports(failures: Vec<(Arc<Session>, GustError)>) {
    if failures.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for (session, error) in failures {
            session.report_error(error).await;
        }
    });
}

fn spawn_close(session: &Arc<Session>, envelope: &Envelope) {
    let session = Arc::clone(session);
    let (code, reason) = (envelope.close_code(), envelope.close_reason());
    tokio::spawn(async move { session.close_with(code, reason).await });
}
