//! Offer/answer state machine for one call.
//!
//! A [`NegotiationCoordinator`] owns one transport object, the candidate relay
//! and every store subscription of a single call. Store callbacks and
//! transport hooks only forward into channels:
//!
//! - an inbound task consumes session snapshots, remote candidate events and
//!   connection state changes from one ordered channel, so applying the
//!   remote description and flushing queued candidates never race;
//! - an outbound task publishes local candidates in discovery order;
//! - a grace timer runs while the transport reports `Disconnected`.
//!
//! `create_call` and `join_call` resume from the last completed step when
//! called again after a store failure. `hangup` is idempotent.

use crate::error::{CallError, Result};
use crate::logger::{analyze_candidates, CallEvent, Emitter};
use crate::media::{LocalStream, RemoteStream};
use crate::peer::ice::{publish_local_candidates, CandidateRelay, Ingest};
use crate::peer::state::{CallState, RemoteDescription, Role};
use crate::peer::transport::PeerTransport;
use crate::peer::types::{ConnectionState, IceCandidate, RemoteTrack, SessionDescription};
use crate::session::{CallRegistry, SessionId, SessionRecord};
use crate::store::{ChangeKind, DocChange, WatchHandle};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

enum Inbound {
    Record(DocChange),
    RemoteCandidate(DocChange),
    Connection(ConnectionState),
    GraceExpired,
}

/// Progress of the handshake, guarded by an async lock held across
/// transport and store calls.
#[derive(Default)]
struct Negotiation {
    role: Option<Role>,
    session_id: Option<SessionId>,
    remote: RemoteDescription,
    local: Option<SessionDescription>,
    persisted: bool,
    subscribed: bool,
    /// Transport reported `Disconnected` and has not recovered yet
    problem: bool,
    relay: CandidateRelay,
}

/// Everything hangup must release.
#[derive(Default)]
struct Lifecycle {
    closed: bool,
    watches: Vec<WatchHandle>,
    tasks: Vec<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
    media: Option<LocalStream>,
}

struct Shared {
    registry: CallRegistry,
    transport: Arc<dyn PeerTransport>,
    emitter: Emitter,
    grace_period: Duration,
    state: watch::Sender<CallState>,
    closed: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
    negotiation: tokio::sync::Mutex<Negotiation>,
    remote_tracks: Arc<Mutex<Vec<RemoteTrack>>>,
    published: Arc<Mutex<Vec<IceCandidate>>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    local_rx: Mutex<Option<mpsc::UnboundedReceiver<IceCandidate>>>,
}

/// Drives one party of one call.
pub struct NegotiationCoordinator {
    shared: Arc<Shared>,
}

impl NegotiationCoordinator {
    pub fn new(
        registry: CallRegistry,
        transport: Arc<dyn PeerTransport>,
        emitter: Emitter,
        grace_period: Duration,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(CallState::New);
        let closed = Arc::new(AtomicBool::new(false));
        let remote_tracks = Arc::new(Mutex::new(Vec::new()));

        // Hooks hold only channels and flags, never the coordinator.
        {
            let closed = closed.clone();
            transport.on_local_candidate(Box::new(move |candidate| {
                if !closed.load(Ordering::SeqCst) {
                    let _ = local_tx.send(candidate);
                }
            }));
        }
        {
            let closed = closed.clone();
            let tracks = remote_tracks.clone();
            let emitter = emitter.clone();
            transport.on_remote_track(Box::new(move |track| {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                info!("remote {:?} track {} added", track.kind, track.id);
                tracks.lock().push(track.clone());
                emitter.emit(CallEvent::RemoteTrack(track));
            }));
        }
        {
            let closed = closed.clone();
            let tx = inbound_tx.clone();
            transport.on_connection_state_change(Box::new(move |st| {
                if !closed.load(Ordering::SeqCst) {
                    let _ = tx.send(Inbound::Connection(st));
                }
            }));
        }

        Self {
            shared: Arc::new(Shared {
                registry,
                transport,
                emitter,
                grace_period,
                state,
                closed,
                lifecycle: Mutex::new(Lifecycle::default()),
                negotiation: tokio::sync::Mutex::new(Negotiation::default()),
                remote_tracks,
                published: Arc::new(Mutex::new(Vec::new())),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                local_rx: Mutex::new(Some(local_rx)),
            }),
        }
    }

    pub fn state(&self) -> CallState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CallState> {
        self.shared.state.subscribe()
    }

    /// Resolves once the call reaches `target`, or fails with
    /// [`CallError::Closed`] if it ends in another terminal state first.
    pub async fn wait_for_state(&self, target: CallState) -> Result<()> {
        let mut rx = self.subscribe_state();
        let reached = rx
            .wait_for(|s| *s == target || s.is_terminal())
            .await
            .map_err(|_| CallError::Closed)?;
        if *reached == target {
            Ok(())
        } else {
            Err(CallError::Closed)
        }
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<CallEvent> {
        self.shared.emitter.subscribe()
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.shared.transport
    }

    pub fn remote_stream(&self) -> RemoteStream {
        RemoteStream {
            tracks: self.shared.remote_tracks.lock().clone(),
        }
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.shared.negotiation.lock().await.session_id.clone()
    }

    /// Adds the captured tracks to the transport; the stream is released on
    /// hangup.
    pub async fn attach_local_media(&self, mut stream: LocalStream) -> Result<()> {
        if let Err(e) = self.shared.ensure_open("attach local media") {
            stream.stop();
            return Err(e);
        }
        for track in &stream.tracks {
            if let Err(e) = self.shared.transport.add_local_track(track).await {
                stream.stop();
                return Err(e);
            }
        }
        let mut lifecycle = self.shared.lifecycle.lock();
        if lifecycle.closed {
            stream.stop();
            return Err(CallError::Closed);
        }
        if let Some(mut previous) = lifecycle.media.replace(stream) {
            previous.stop();
        }
        Ok(())
    }

    /// Caller path: allocates a session, publishes the offer and starts
    /// watching for the answer and the callee's candidates.
    pub async fn create_call(&self) -> Result<SessionId> {
        let shared = &self.shared;
        let mut neg = shared.negotiation.lock().await;
        shared.ensure_open("create a call")?;

        if neg.role == Some(Role::Callee) {
            return Err(shared.invalid_state("create a call"));
        }
        if let (Some(id), true) = (&neg.session_id, neg.subscribed) {
            debug!("create_call: session {} already set up", id);
            return Ok(id.clone());
        }

        let id = match neg.session_id.clone() {
            Some(id) => id,
            None => {
                let id = shared.registry.create_session().await?;
                neg.role = Some(Role::Caller);
                neg.session_id = Some(id.clone());
                id
            }
        };
        shared.ensure_not_closed()?;
        shared.start_tasks(&id, Role::Caller)?;

        let offer = match neg.local.clone() {
            Some(offer) => offer,
            None => {
                let offer = shared.transport.create_offer().await?;
                shared.transport.set_local_description(offer.clone()).await?;
                neg.local = Some(offer.clone());
                offer
            }
        };
        shared.ensure_not_closed()?;

        if !neg.persisted {
            shared.registry.publish_offer(&id, &offer).await?;
            neg.persisted = true;
            shared.transition(CallState::OfferCreated);
        }

        shared.watch_record(&id)?;
        shared.watch_remote_candidates(&id, Role::Callee)?;
        neg.subscribed = true;
        shared.transition(CallState::AwaitingAnswer);
        info!("call {} created, awaiting answer", id);
        Ok(id)
    }

    /// Callee path: applies the stored offer, publishes an answer and starts
    /// watching the caller's candidates.
    pub async fn join_call(&self, session_id: &str) -> Result<()> {
        let shared = &self.shared;
        let mut neg = shared.negotiation.lock().await;
        shared.ensure_open("join a call")?;

        match (neg.role, neg.session_id.as_deref()) {
            (Some(Role::Caller), _) => return Err(shared.invalid_state("join a call")),
            (Some(Role::Callee), Some(current)) if current != session_id => {
                return Err(shared.invalid_state("join another call"))
            }
            _ => {}
        }
        if neg.subscribed {
            debug!("join_call: session {} already joined", session_id);
            return Ok(());
        }

        if neg.remote == RemoteDescription::Unset {
            // read once; nothing is touched until the record checks out
            let session = shared.registry.open_session(session_id).await?;
            let offer = session
                .offer
                .ok_or_else(|| CallError::SessionNotFound(session_id.to_string()))?;
            if session.answer.is_some() {
                return Err(CallError::SessionAlreadyAnswered(session_id.to_string()));
            }
            shared.ensure_not_closed()?;

            neg.role = Some(Role::Callee);
            neg.session_id = Some(session_id.to_string());
            shared.start_tasks(session_id, Role::Callee)?;
            shared.apply_remote(&mut neg, offer).await?;
            shared.transition(CallState::OfferApplied);
        }
        shared.ensure_not_closed()?;

        let answer = match neg.local.clone() {
            Some(answer) => answer,
            None => {
                let answer = shared.transport.create_answer().await?;
                shared.transport.set_local_description(answer.clone()).await?;
                neg.local = Some(answer.clone());
                answer
            }
        };
        shared.ensure_not_closed()?;

        if !neg.persisted {
            shared.registry.publish_answer(session_id, &answer).await?;
            neg.persisted = true;
            shared.transition(CallState::AnswerSent);
        }

        shared.watch_remote_candidates(session_id, Role::Caller)?;
        neg.subscribed = true;
        info!("joined call {}", session_id);
        Ok(())
    }

    /// Cancels every subscription, closes the transport and releases local
    /// media. Does nothing if the call is already closed.
    pub async fn hangup(&self) {
        let shared = &self.shared;
        let Some(mut released) = shared.shutdown() else {
            debug!("hangup: already closed");
            return;
        };
        if let Some(media) = released.media.as_mut() {
            media.stop();
        }
        if let Err(e) = shared.transport.close().await {
            warn!("closing transport: {e}");
        }
        shared.transition(CallState::Closed);
        shared.emitter.emit_closed();
        info!("call closed");
    }
}

/// Dropping without [`hangup`](NegotiationCoordinator::hangup) releases the
/// same resources; the transport is closed on the current runtime, if any.
impl Drop for NegotiationCoordinator {
    fn drop(&mut self) {
        let Some(mut released) = self.shared.shutdown() else {
            return;
        };
        if let Some(media) = released.media.as_mut() {
            media.stop();
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let transport = self.shared.transport.clone();
                handle.spawn(async move {
                    if let Err(e) = transport.close().await {
                        warn!("closing transport of dropped call: {e}");
                    }
                });
            }
            Err(_) => warn!("call dropped outside a runtime, transport left open"),
        }
    }
}

impl Shared {
    fn current(&self) -> CallState {
        *self.state.borrow()
    }

    fn invalid_state(&self, operation: &'static str) -> CallError {
        CallError::InvalidState {
            operation,
            state: self.current(),
        }
    }

    /// Re-checked after every await of call setup, so nothing is written to
    /// the store once hangup has started.
    fn ensure_not_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CallError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CallError::Closed);
        }
        if self.current().is_terminal() {
            return Err(self.invalid_state(operation));
        }
        Ok(())
    }

    /// Moves to `to` unless the call already ended. `Closed` is reachable
    /// from `Failed`.
    fn transition(&self, to: CallState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            let allowed = match *current {
                CallState::Closed => false,
                CallState::Failed => to == CallState::Closed,
                from => from != to,
            };
            if allowed {
                info!("call state {} -> {}", current, to);
                *current = to;
            }
            allowed
        });
        if changed {
            self.emitter.emit(CallEvent::StateChanged(to));
        }
        changed
    }

    fn fail(&self, reason: &str) {
        error!("call failed: {reason}");
        if self.transition(CallState::Failed) {
            self.emitter.emit_connection_failed();
        }
    }

    /// Applies a remote description, at most once per call.
    async fn apply_remote(&self, neg: &mut Negotiation, desc: SessionDescription) -> Result<()> {
        if neg.remote == RemoteDescription::Applied {
            debug_assert!(false, "remote description applied twice");
            return Err(CallError::DoubleApplyAttempted);
        }
        match self.transport.set_remote_description(desc).await {
            Ok(()) => {
                neg.remote = RemoteDescription::Applied;
                for e in neg.relay.flush(self.transport.as_ref()).await {
                    self.emitter
                        .emit_candidate_error(format!("applying queued candidate: {e}"));
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                self.fail(&e.to_string());
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Marks the call closed and hands back what must be released. `None`
    /// if it was already closed.
    fn shutdown(&self) -> Option<Lifecycle> {
        // watches are cancelled before the caller's first await
        let mut released = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.closed {
                return None;
            }
            self.closed.store(true, Ordering::SeqCst);
            std::mem::replace(
                &mut *lifecycle,
                Lifecycle {
                    closed: true,
                    ..Lifecycle::default()
                },
            )
        };
        for watch in released.watches.iter_mut() {
            watch.cancel();
        }
        for task in released.tasks.drain(..) {
            task.abort();
        }
        if let Some(grace) = released.grace.take() {
            grace.abort();
        }
        Some(released)
    }

    fn register_watch(&self, mut handle: WatchHandle) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.closed {
            handle.cancel();
            return Err(CallError::Closed);
        }
        debug!("watching {}", handle.path());
        lifecycle.watches.push(handle);
        Ok(())
    }

    fn register_task(&self, task: JoinHandle<()>) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.closed {
            task.abort();
            return Err(CallError::Closed);
        }
        lifecycle.tasks.push(task);
        Ok(())
    }

    /// Starts the inbound loop and the local candidate publisher, once.
    fn start_tasks(self: &Arc<Self>, session_id: &str, role: Role) -> Result<()> {
        if let Some(rx) = self.inbound_rx.lock().take() {
            let task = tokio::spawn(inbound_loop(self.clone(), rx));
            self.register_task(task)?;
        }
        if let Some(rx) = self.local_rx.lock().take() {
            let collection = self.registry.layout().candidates_path(session_id, role);
            let task = tokio::spawn(publish_local_candidates(
                self.registry.store().clone(),
                collection,
                rx,
                self.published.clone(),
                self.emitter.clone(),
            ));
            self.register_task(task)?;
        }
        Ok(())
    }

    fn watch_record(&self, session_id: &str) -> Result<()> {
        let path = self.registry.layout().session_path(session_id);
        self.watch(&path, Inbound::Record)
    }

    /// Watches the collection written by `writer`.
    fn watch_remote_candidates(&self, session_id: &str, writer: Role) -> Result<()> {
        let path = self.registry.layout().candidates_path(session_id, writer);
        self.watch(&path, Inbound::RemoteCandidate)
    }

    /// Subscribes `path` into the inbound channel; a path already watched
    /// is left alone.
    fn watch(&self, path: &str, wrap: fn(DocChange) -> Inbound) -> Result<()> {
        if self
            .lifecycle
            .lock()
            .watches
            .iter()
            .any(|w| w.path() == path && w.is_active())
        {
            return Ok(());
        }
        let tx = self.inbound_tx.clone();
        let closed = self.closed.clone();
        let handle = self.registry.store().watch(
            path,
            Arc::new(move |change| {
                if !closed.load(Ordering::SeqCst) {
                    let _ = tx.send(wrap(change));
                }
            }),
        )?;
        self.register_watch(handle)
    }

    async fn on_record(&self, change: DocChange) {
        if change.kind == ChangeKind::Removed {
            warn!("session record {} was removed", change.id);
            return;
        }
        let record = match SessionRecord::from_value(&change.id, change.data) {
            Ok(record) => record,
            Err(e) => {
                warn!("ignoring unreadable session snapshot: {e}");
                return;
            }
        };
        let Some(answer) = record.answer else {
            return;
        };

        let mut neg = self.negotiation.lock().await;
        if neg.role != Some(Role::Caller) {
            return;
        }
        if neg.remote == RemoteDescription::Applied {
            debug!("answer already applied, snapshot ignored");
            return;
        }
        match self.apply_remote(&mut neg, answer).await {
            Ok(()) => {
                self.transition(CallState::AnswerApplied);
            }
            Err(e) if e.is_fatal() => {}
            // remote stays unset; the next snapshot retries
            Err(e) => warn!("applying answer: {e}"),
        }
    }

    async fn on_remote_candidate(&self, change: DocChange) {
        let mut neg = self.negotiation.lock().await;
        let id = change.id.clone();
        match neg.relay.ingest(self.transport.as_ref(), change).await {
            Ok(Ingest::Applied) => debug!("applied remote candidate {}", id),
            Ok(outcome) => debug!("remote candidate {}: {:?}", id, outcome),
            Err(e) => self
                .emitter
                .emit_candidate_error(format!("remote candidate {id}: {e}")),
        }
    }

    async fn on_connection(self: &Arc<Self>, st: ConnectionState) {
        let mut neg = self.negotiation.lock().await;
        match st {
            ConnectionState::Connected => {
                if let Some(grace) = self.lifecycle.lock().grace.take() {
                    grace.abort();
                }
                if !self.current().has_remote_description() {
                    debug!("connected before negotiation finished, ignoring");
                    return;
                }
                if std::mem::take(&mut neg.problem) {
                    self.emitter.emit_connection_recovered();
                }
                if self.transition(CallState::Connected) {
                    analyze_candidates(&self.published.lock());
                    self.emitter.emit_connected();
                }
            }
            ConnectionState::Disconnected => {
                if neg.problem {
                    debug!("disconnect already pending, ignoring");
                    return;
                }
                neg.problem = true;
                self.emitter.emit_connection_problem();

                let tx = self.inbound_tx.clone();
                let grace_period = self.grace_period;
                let grace = tokio::spawn(async move {
                    tokio::time::sleep(grace_period).await;
                    let _ = tx.send(Inbound::GraceExpired);
                });
                let mut lifecycle = self.lifecycle.lock();
                if lifecycle.closed {
                    grace.abort();
                } else if let Some(previous) = lifecycle.grace.replace(grace) {
                    previous.abort();
                }
            }
            ConnectionState::Failed => {
                if let Some(grace) = self.lifecycle.lock().grace.take() {
                    grace.abort();
                }
                self.fail("transport reported failure");
            }
            other => debug!("connection state {:?}, ignoring", other),
        }
    }

    async fn on_grace_expired(&self) {
        let mut neg = self.negotiation.lock().await;
        if std::mem::take(&mut neg.problem) {
            info!(
                "no recovery within {} s",
                self.grace_period.as_secs_f32()
            );
            self.fail("connection lost");
        }
    }
}

async fn inbound_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(event) = rx.recv().await {
        if shared.closed.load(Ordering::SeqCst) || shared.current().is_terminal() {
            continue;
        }
        match event {
            Inbound::Record(change) => shared.on_record(change).await,
            Inbound::RemoteCandidate(change) => shared.on_remote_candidate(change).await,
            Inbound::Connection(st) => shared.on_connection(st).await,
            Inbound::GraceExpired => shared.on_grace_expired().await,
        }
    }
}
