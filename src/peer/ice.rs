use crate::error::{CallError, Result, StoreError};
use crate::logger::{dump_candidate, Emitter};
use crate::peer::transport::PeerTransport;
use crate::peer::types::IceCandidate;
use crate::store::{ChangeKind, DocChange, DocumentStore};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What the relay did with one remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Handed to the transport
    Applied,
    /// Held until the remote description is applied
    Queued,
    /// Same candidate seen before
    Duplicate,
    /// Not an `added` event
    Ignored,
}

/// Remote side of trickle ICE for one call.
///
/// Candidates from the peer's collection are applied in delivery order. Until
/// the remote description is applied they are queued; [`flush`](Self::flush)
/// drains the queue in arrival order and switches to direct application.
/// Candidates are compared by value, so a re-delivered `added` event is
/// dropped.
#[derive(Debug, Default)]
pub struct CandidateRelay {
    ready: bool,
    pending: VecDeque<IceCandidate>,
    seen: HashSet<IceCandidate>,
    applied: usize,
}

impl CandidateRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn applied(&self) -> usize {
        self.applied
    }

    /// Handles one change from the peer's candidate collection.
    pub async fn ingest(
        &mut self,
        transport: &dyn PeerTransport,
        change: DocChange,
    ) -> Result<Ingest> {
        if change.kind != ChangeKind::Added {
            // кандидаты только добавляются
            debug!("ignoring {:?} event for candidate {}", change.kind, change.id);
            return Ok(Ingest::Ignored);
        }

        let candidate: IceCandidate =
            serde_json::from_value(change.data).map_err(|source| {
                CallError::Store(StoreError::Malformed {
                    path: change.id.clone(),
                    source,
                })
            })?;

        if !self.seen.insert(candidate.clone()) {
            debug!("duplicate candidate {} dropped", change.id);
            return Ok(Ingest::Duplicate);
        }

        dump_candidate("REMOTE", &candidate);

        if !self.ready {
            // Если remote description еще не установлен, сохраняем кандидат
            debug!("Remote description not set yet, queuing candidate");
            self.pending.push_back(candidate);
            return Ok(Ingest::Queued);
        }

        transport.add_remote_candidate(candidate).await?;
        self.applied += 1;
        Ok(Ingest::Applied)
    }

    /// Применяет все отложенные кандидаты после установки remote description
    ///
    /// Failures are returned rather than aborting the flush; a failed
    /// candidate is not retried.
    pub async fn flush(&mut self, transport: &dyn PeerTransport) -> Vec<CallError> {
        self.ready = true;
        let mut errors = Vec::new();

        while let Some(candidate) = self.pending.pop_front() {
            debug!("Applying pending candidate: {}", candidate.candidate);
            match transport.add_remote_candidate(candidate).await {
                Ok(()) => self.applied += 1,
                Err(e) => errors.push(e),
            }
        }
        errors
    }
}

/// Writes locally discovered candidates to `collection` in discovery order
/// until the channel closes.
pub(crate) async fn publish_local_candidates(
    store: Arc<dyn DocumentStore>,
    collection: String,
    mut rx: mpsc::UnboundedReceiver<IceCandidate>,
    published: Arc<Mutex<Vec<IceCandidate>>>,
    emitter: Emitter,
) {
    while let Some(candidate) = rx.recv().await {
        let value = match serde_json::to_value(&candidate) {
            Ok(value) => value,
            Err(e) => {
                emitter.emit_candidate_error(format!("encoding local candidate: {e}"));
                continue;
            }
        };
        match store.append(&collection, value).await {
            Ok(id) => {
                debug!("published local candidate {} to {}", id, collection);
                published.lock().push(candidate);
            }
            Err(e) => emitter.emit_candidate_error(format!(
                "publishing local candidate to {collection}: {e}"
            )),
        }
    }
    info!("local candidate publishing for {} stopped", collection);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::SessionDescription;
    use crate::store::MemoryStore;
    use crate::testing::{candidate, FakeTransport};
    use serde_json::json;

    fn added(id: &str, cand: &IceCandidate) -> DocChange {
        DocChange::new(ChangeKind::Added, id, serde_json::to_value(cand).unwrap())
    }

    #[tokio::test]
    async fn queued_until_flush_then_in_order() {
        let transport = FakeTransport::new("callee");
        let mut relay = CandidateRelay::new();
        let (a, b, c) = (candidate(1), candidate(2), candidate(3));

        assert_eq!(relay.ingest(&*transport, added("a", &a)).await.unwrap(), Ingest::Queued);
        assert_eq!(relay.ingest(&*transport, added("b", &b)).await.unwrap(), Ingest::Queued);
        assert!(transport.applied_candidates().is_empty());

        transport
            .set_remote_description(SessionDescription::offer("v=0 remote"))
            .await
            .unwrap();
        assert!(relay.flush(&*transport).await.is_empty());
        assert_eq!(relay.ingest(&*transport, added("c", &c)).await.unwrap(), Ingest::Applied);

        assert_eq!(transport.applied_candidates(), vec![a, b, c]);
        assert_eq!(relay.pending(), 0);
        assert_eq!(relay.applied(), 3);
    }

    #[tokio::test]
    async fn modified_and_removed_never_reach_transport() {
        let transport = FakeTransport::new("callee");
        transport
            .set_remote_description(SessionDescription::offer("v=0 remote"))
            .await
            .unwrap();
        let mut relay = CandidateRelay::new();
        relay.flush(&*transport).await;

        let data = serde_json::to_value(candidate(1)).unwrap();
        for kind in [ChangeKind::Modified, ChangeKind::Removed] {
            let outcome = relay
                .ingest(&*transport, DocChange::new(kind, "x", data.clone()))
                .await
                .unwrap();
            assert_eq!(outcome, Ingest::Ignored);
        }
        assert!(transport.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn duplicates_are_dropped_before_and_after_flush() {
        let transport = FakeTransport::new("callee");
        let mut relay = CandidateRelay::new();
        let a = candidate(1);

        relay.ingest(&*transport, added("a", &a)).await.unwrap();
        assert_eq!(
            relay.ingest(&*transport, added("a", &a)).await.unwrap(),
            Ingest::Duplicate
        );

        transport
            .set_remote_description(SessionDescription::offer("v=0 remote"))
            .await
            .unwrap();
        relay.flush(&*transport).await;
        assert_eq!(
            relay.ingest(&*transport, added("a-again", &a)).await.unwrap(),
            Ingest::Duplicate
        );
        assert_eq!(transport.applied_candidates(), vec![a]);
    }

    #[tokio::test]
    async fn malformed_candidate_is_a_store_error() {
        let transport = FakeTransport::new("callee");
        let mut relay = CandidateRelay::new();
        let err = relay
            .ingest(
                &*transport,
                DocChange::new(ChangeKind::Added, "bad", json!({"sdpMid": 3})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Store(StoreError::Malformed { .. })));
    }

    #[tokio::test]
    async fn flush_reports_failures_and_continues() {
        let transport = FakeTransport::new("callee");
        let mut relay = CandidateRelay::new();
        relay.ingest(&*transport, added("a", &candidate(1))).await.unwrap();
        relay.ingest(&*transport, added("b", &candidate(2))).await.unwrap();

        // no remote description on the transport: every add fails
        let errors = relay.flush(&*transport).await;
        assert_eq!(errors.len(), 2);
        assert_eq!(relay.pending(), 0);
        assert!(relay.is_ready());
    }

    #[tokio::test]
    async fn local_candidates_are_appended_in_order() {
        let store = MemoryStore::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let published = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(publish_local_candidates(
            Arc::new(store.clone()),
            "calls/x/offerCandidates".into(),
            rx,
            published.clone(),
            Emitter::default(),
        ));

        for n in 1..=3 {
            tx.send(candidate(n)).unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let written: Vec<IceCandidate> = store
            .list("calls/x/offerCandidates")
            .into_iter()
            .map(|(_, v)| serde_json::from_value(v).unwrap())
            .collect();
        assert_eq!(written, vec![candidate(1), candidate(2), candidate(3)]);
        assert_eq!(published.lock().len(), 3);
    }

    #[tokio::test]
    async fn publish_failure_is_reported_not_fatal() {
        let store = MemoryStore::new();
        store.set_available(false);
        let emitter = Emitter::default();
        let mut events = emitter.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let published = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(publish_local_candidates(
            Arc::new(store.clone()),
            "calls/x/offerCandidates".into(),
            rx,
            published.clone(),
            emitter,
        ));

        tx.send(candidate(1)).unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            crate::logger::CallEvent::CandidateError(_)
        ));
        assert!(published.lock().is_empty());
    }
}
