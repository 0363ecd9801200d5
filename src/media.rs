//! Local capture and remote stream bookkeeping.

use crate::error::Result;
use crate::peer::types::{LocalTrack, RemoteTrack, TrackKind};
use async_trait::async_trait;
use std::fmt;

/// Source of the local camera/microphone stream.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn open(&self) -> Result<LocalStream>;
}

/// Captured local media. [`stop`](Self::stop) releases the devices.
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LocalStream {
    pub fn new(
        id: impl Into<String>,
        tracks: Vec<LocalTrack>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            tracks,
            release: Some(Box::new(release)),
        }
    }

    pub fn is_live(&self) -> bool {
        self.release.is_some()
    }

    pub fn stop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Tracks received from the peer, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStream {
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn first_audio_track(&self) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Audio)
    }

    /// Audio-only view of the stream, holding just its first audio track.
    pub fn audio_only(&self) -> Option<RemoteStream> {
        self.first_audio_track().map(|track| RemoteStream {
            tracks: vec![track.clone()],
        })
    }
}
