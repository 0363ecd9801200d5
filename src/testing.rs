//! Test doubles for the external collaborators.

use crate::error::{CallError, Result};
use crate::media::{LocalStream, MediaCapture};
use crate::config::CallConfig;
use crate::peer::transport::{
    CandidateHandler, PeerTransport, StateHandler, TrackHandler, TransportFactory,
};
use crate::peer::types::{
    ConnectionState, IceCandidate, LocalTrack, RemoteTrack, SessionDescription, TrackKind,
};
use crate::transcription::{AudioRecorder, AudioWindow, Transcriber, Transcript};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub fn candidate(n: u16) -> IceCandidate {
    IceCandidate::new(
        format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5440{n} typ host"),
        Some("0".into()),
        Some(0),
    )
}

/// Records every call; mimics a connection that rejects candidates without
/// a remote description and descriptions that are not SDP.
pub struct FakeTransport {
    name: &'static str,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    remote_sets: AtomicUsize,
    closes: AtomicUsize,
    applied: Mutex<Vec<IceCandidate>>,
    tracks: Mutex<Vec<LocalTrack>>,
    on_candidate: Mutex<Option<CandidateHandler>>,
    on_track: Mutex<Option<TrackHandler>>,
    on_state: Mutex<Option<StateHandler>>,
    offer_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl FakeTransport {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            remote_sets: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            on_candidate: Mutex::new(None),
            on_track: Mutex::new(None),
            on_state: Mutex::new(None),
            offer_gate: Mutex::new(None),
        })
    }

    /// Makes `create_offer` signal the first handle on entry and wait for
    /// the second before returning.
    pub fn gate_offers(&self) -> (Arc<Notify>, Arc<Notify>) {
        let gate = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        *self.offer_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn remote_description_sets(&self) -> usize {
        self.remote_sets.load(Ordering::SeqCst)
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        self.tracks.lock().clone()
    }

    /// Fires the local-candidate hook.
    pub fn discover(&self, candidate: IceCandidate) {
        if let Some(handler) = self.on_candidate.lock().as_ref() {
            handler(candidate);
        }
    }

    pub fn announce_track(&self, track: RemoteTrack) {
        if let Some(handler) = self.on_track.lock().as_ref() {
            handler(track);
        }
    }

    pub fn report_state(&self, state: ConnectionState) {
        if let Some(handler) = self.on_state.lock().as_ref() {
            handler(state);
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let gate = self.offer_gate.lock().clone();
        if let Some((started, release)) = gate {
            started.notify_one();
            release.notified().await;
        }
        Ok(SessionDescription::offer(format!(
            "v=0\r\no={} 1 1 IN IP4 127.0.0.1\r\n",
            self.name
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.remote.lock().is_none() {
            return Err(CallError::Transport("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!(
            "v=0\r\no={} 2 2 IN IP4 127.0.0.1\r\n",
            self.name
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        *self.local.lock() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if !desc.payload.starts_with("v=0") {
            return Err(CallError::InvalidDescription(format!(
                "{}: payload is not SDP",
                self.name
            )));
        }
        self.remote_sets.fetch_add(1, Ordering::SeqCst);
        *self.remote.lock() = Some(desc);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.remote.lock().is_none() {
            return Err(CallError::Transport(format!(
                "{}: candidate added without remote description",
                self.name
            )));
        }
        self.applied.lock().push(candidate);
        Ok(())
    }

    async fn add_local_track(&self, track: &LocalTrack) -> Result<()> {
        self.tracks.lock().push(track.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_local_candidate(&self, handler: CandidateHandler) {
        *self.on_candidate.lock() = Some(handler);
    }

    fn on_remote_track(&self, handler: TrackHandler) {
        *self.on_track.lock() = Some(handler);
    }

    fn on_connection_state_change(&self, handler: StateHandler) {
        *self.on_state.lock() = Some(handler);
    }
}

/// Hands out [`FakeTransport`]s and keeps them for inspection.
pub struct FakeTransportFactory {
    name: &'static str,
    pub created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeTransportFactory {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            created: Mutex::new(Vec::new()),
        })
    }

    /// Most recently created transport.
    pub fn last(&self) -> Arc<FakeTransport> {
        self.created.lock().last().cloned().expect("no transport created")
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(&self, _config: &CallConfig) -> Result<Arc<dyn PeerTransport>> {
        let transport = FakeTransport::new(self.name);
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Camera + microphone with a release counter.
#[derive(Default)]
pub struct FakeMedia {
    pub releases: Arc<AtomicUsize>,
}

#[async_trait]
impl MediaCapture for FakeMedia {
    async fn open(&self) -> Result<LocalStream> {
        let releases = self.releases.clone();
        Ok(LocalStream::new(
            "local",
            vec![
                LocalTrack {
                    id: "mic".into(),
                    stream_id: "local".into(),
                    kind: TrackKind::Audio,
                },
                LocalTrack {
                    id: "cam".into(),
                    stream_id: "local".into(),
                    kind: TrackKind::Video,
                },
            ],
            move || {
                releases.fetch_add(1, Ordering::SeqCst);
            },
        ))
    }
}

/// Produces a mono 16-bit WAV of a constant tone level.
pub struct FakeRecorder {
    pub level: f32,
    pub sample_rate: u32,
    pub recorded: Mutex<Vec<(String, Duration)>>,
}

impl FakeRecorder {
    pub fn new(level: f32) -> Self {
        Self {
            level,
            sample_rate: 16_000,
            recorded: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AudioRecorder for FakeRecorder {
    async fn record(&self, track: &RemoteTrack, duration: Duration) -> Result<AudioWindow> {
        self.recorded.lock().push((track.id.clone(), duration));
        let samples = (self.sample_rate as u128 * duration.as_millis() / 1000) as usize;
        let wav = crate::transcription::encode_wav(&vec![self.level; samples], self.sample_rate, 1)?;
        Ok(AudioWindow::new(wav, duration))
    }
}

/// Returns a canned transcript and remembers what it was given.
pub struct FakeTranscriber {
    pub output: Transcript,
    pub received: Mutex<Vec<(usize, u32)>>,
}

impl FakeTranscriber {
    pub fn new(output: Transcript) -> Self {
        Self {
            output,
            received: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<Transcript> {
        self.received.lock().push((samples.len(), sample_rate));
        Ok(self.output.clone())
    }
}
