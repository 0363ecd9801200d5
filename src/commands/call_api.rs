use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::logger::{CallEvent, Emitter};
use crate::media::{LocalStream, MediaCapture};
use crate::peer::coordinator::NegotiationCoordinator;
use crate::peer::state::CallState;
use crate::peer::transport::TransportFactory;
use crate::session::{CallRegistry, SessionId};
use crate::store::DocumentStore;
use crate::transcription::TranscriptionBridge;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

#[derive(Default)]
struct ClientState {
    call: Option<Arc<NegotiationCoordinator>>,
    /// Captured before a call exists; attached to the next call
    media: Option<LocalStream>,
}

/// Entry point for one participant: media, call setup, hangup and
/// transcription.
///
/// Every call gets a fresh transport and coordinator. Events of all calls
/// are published on one channel.
pub struct CallClient {
    config: CallConfig,
    registry: CallRegistry,
    transports: Arc<dyn TransportFactory>,
    media: Arc<dyn MediaCapture>,
    bridge: TranscriptionBridge,
    emitter: Emitter,
    state: Mutex<ClientState>,
}

impl CallClient {
    pub fn new(
        config: CallConfig,
        store: Arc<dyn DocumentStore>,
        transports: Arc<dyn TransportFactory>,
        media: Arc<dyn MediaCapture>,
        bridge: TranscriptionBridge,
    ) -> Self {
        let registry = CallRegistry::new(store, config.layout.clone());
        Self {
            config,
            registry,
            transports,
            media,
            bridge,
            emitter: Emitter::default(),
            state: Mutex::new(ClientState::default()),
        }
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Opens camera and microphone. The stream joins the current call, or the
    /// next one if none is active.
    pub async fn start_local_media(&self) -> Result<()> {
        let stream = self.media.open().await?;
        info!("local media {} started with {} tracks", stream.id, stream.tracks.len());

        let mut state = self.state.lock().await;
        let current = state.call.clone();
        match current {
            Some(call) if !call.state().is_terminal() => {
                drop(state);
                call.attach_local_media(stream).await
            }
            _ => {
                if let Some(mut previous) = state.media.replace(stream) {
                    previous.stop();
                }
                Ok(())
            }
        }
    }

    /// Starts a call as the caller and returns the id to share.
    pub async fn create_call(&self) -> Result<SessionId> {
        let call = self.current_or_new_call().await?;
        call.create_call().await
    }

    /// Joins the call stored under `id` as the callee.
    pub async fn join_call(&self, id: &str) -> Result<()> {
        let call = self.current_or_new_call().await?;
        call.join_call(id).await
    }

    /// Ends the current call; does nothing without one.
    pub async fn hangup(&self) {
        let (call, media) = {
            let mut state = self.state.lock().await;
            (state.call.clone(), state.media.take())
        };
        if let Some(mut media) = media {
            media.stop();
        }
        match call {
            Some(call) => call.hangup().await,
            None => info!("hangup without an active call"),
        }
    }

    /// Records a window of remote audio and returns its transcript. Uses the
    /// configured window when `duration_ms` is `None`.
    pub async fn start_transcription(&self, duration_ms: Option<u64>) -> Result<String> {
        let duration = duration_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.transcription_window());
        let call = self
            .state
            .lock()
            .await
            .call
            .clone()
            .ok_or(CallError::NoRemoteStream)?;

        let stream = call.remote_stream();
        if stream.tracks.is_empty() {
            return Err(CallError::NoRemoteStream);
        }
        let audio = stream.audio_only().ok_or(CallError::NoAudioTrack)?;
        self.bridge.run(&audio, duration).await
    }

    pub async fn state(&self) -> CallState {
        match &self.state.lock().await.call {
            Some(call) => call.state(),
            None => CallState::New,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == CallState::Connected
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.emitter.subscribe()
    }

    /// Coordinator of the active call, if any.
    pub async fn current_call(&self) -> Option<Arc<NegotiationCoordinator>> {
        self.state.lock().await.call.clone()
    }

    async fn current_or_new_call(&self) -> Result<Arc<NegotiationCoordinator>> {
        let mut state = self.state.lock().await;
        if let Some(call) = &state.call {
            if !call.state().is_terminal() {
                return Ok(call.clone());
            }
        }
        if let Some(old) = state.call.take() {
            // a failed call still holds its transport
            old.hangup().await;
        }

        let transport = self.transports.create(&self.config).await?;
        let call = Arc::new(NegotiationCoordinator::new(
            self.registry.clone(),
            transport,
            self.emitter.clone(),
            self.config.grace_period(),
        ));
        if let Some(stream) = state.media.take() {
            if let Err(e) = call.attach_local_media(stream).await {
                warn!("attaching local media: {e}");
            }
        }
        state.call = Some(call.clone());
        Ok(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::{ConnectionState, RemoteTrack, TrackKind};
    use crate::store::MemoryStore;
    use crate::testing::{FakeMedia, FakeRecorder, FakeTranscriber, FakeTransportFactory};
    use crate::transcription::Transcript;
    use std::sync::atomic::Ordering;
    use tokio::time::timeout;

    struct Harness {
        client: CallClient,
        transports: Arc<FakeTransportFactory>,
        media: Arc<FakeMedia>,
        recorder: Arc<FakeRecorder>,
    }

    fn harness(store: &MemoryStore, name: &'static str, transcript: Transcript) -> Harness {
        let transports = FakeTransportFactory::new(name);
        let media = Arc::new(FakeMedia::default());
        let recorder = Arc::new(FakeRecorder::new(0.1));
        let bridge = TranscriptionBridge::new(
            recorder.clone(),
            Arc::new(FakeTranscriber::new(transcript)),
        );
        let client = CallClient::new(
            CallConfig::default(),
            Arc::new(store.clone()),
            transports.clone(),
            media.clone(),
            bridge,
        );
        Harness {
            client,
            transports,
            media,
            recorder,
        }
    }

    async fn wait_connected(client: &CallClient) {
        let call = client.current_call().await.unwrap();
        timeout(Duration::from_secs(2), call.wait_for_state(CallState::Connected))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn two_clients_connect_and_transcribe() {
        let store = MemoryStore::new();
        let alice = harness(&store, "alice", Transcript::Text("unused".into()));
        let bob = harness(
            &store,
            "bob",
            Transcript::Segments(vec!["hello".into(), " there".into()]),
        );

        alice.client.start_local_media().await.unwrap();
        let id = alice.client.create_call().await.unwrap();
        assert_eq!(alice.transports.last().local_tracks().len(), 2);

        bob.client.join_call(&id).await.unwrap();
        let alice_call = alice.client.current_call().await.unwrap();
        timeout(
            Duration::from_secs(2),
            alice_call.wait_for_state(CallState::AnswerApplied),
        )
        .await
        .unwrap()
        .unwrap();

        alice.transports.last().report_state(ConnectionState::Connected);
        bob.transports.last().report_state(ConnectionState::Connected);
        wait_connected(&alice.client).await;
        wait_connected(&bob.client).await;
        assert!(alice.client.is_connected().await);
        assert!(bob.client.is_connected().await);

        bob.transports.last().announce_track(RemoteTrack {
            id: "alice-mic".into(),
            stream_id: "alice".into(),
            kind: TrackKind::Audio,
        });
        let text = bob.client.start_transcription(Some(300)).await.unwrap();
        assert_eq!(text, "hello there");
        assert_eq!(
            bob.recorder.recorded.lock().clone(),
            vec![("alice-mic".to_string(), Duration::from_millis(300))]
        );
    }

    #[tokio::test]
    async fn transcription_needs_remote_audio() {
        let store = MemoryStore::new();
        let bob = harness(&store, "bob", Transcript::Text("x".into()));
        assert!(matches!(
            bob.client.start_transcription(None).await,
            Err(CallError::NoRemoteStream)
        ));

        let alice = harness(&store, "alice", Transcript::Text("x".into()));
        let id = alice.client.create_call().await.unwrap();
        bob.client.join_call(&id).await.unwrap();
        assert!(matches!(
            bob.client.start_transcription(None).await,
            Err(CallError::NoRemoteStream)
        ));

        bob.transports.last().announce_track(RemoteTrack {
            id: "cam".into(),
            stream_id: "alice".into(),
            kind: TrackKind::Video,
        });
        assert!(matches!(
            bob.client.start_transcription(None).await,
            Err(CallError::NoAudioTrack)
        ));
    }

    #[tokio::test]
    async fn hangup_twice_and_call_again() {
        let store = MemoryStore::new();
        let alice = harness(&store, "alice", Transcript::Text("x".into()));
        let mut events = alice.client.subscribe_events();

        alice.client.start_local_media().await.unwrap();
        let first = alice.client.create_call().await.unwrap();
        alice.client.hangup().await;
        alice.client.hangup().await;

        assert_eq!(alice.client.state().await, CallState::Closed);
        assert_eq!(alice.transports.last().close_count(), 1);
        assert_eq!(alice.media.releases.load(Ordering::SeqCst), 1);
        assert_eq!(store.watcher_count(), 0);

        let second = alice.client.create_call().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(alice.transports.created.lock().len(), 2);
        assert_eq!(alice.client.state().await, CallState::AwaitingAnswer);

        let mut closed = 0;
        while let Ok(evt) = events.try_recv() {
            if evt == CallEvent::Closed {
                closed += 1;
            }
        }
        assert_eq!(closed, 1);
    }

    #[tokio::test]
    async fn hangup_without_call_releases_pending_media() {
        let store = MemoryStore::new();
        let alice = harness(&store, "alice", Transcript::Text("x".into()));
        alice.client.start_local_media().await.unwrap();
        alice.client.hangup().await;
        assert_eq!(alice.media.releases.load(Ordering::SeqCst), 1);
        assert_eq!(alice.client.state().await, CallState::New);
        assert!(alice.transports.created.lock().is_empty());
    }
}
