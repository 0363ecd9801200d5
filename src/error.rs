//! Error types for the store, configuration and call layers.

use crate::peer::state::CallState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CallError>;

/// Failures reported by a [`DocumentStore`](crate::store::DocumentStore).
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or rejected the operation
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// `update` targeted a document that does not exist
    #[error("document not found: {0}")]
    NotFound(String),

    /// A document exists but does not have the expected shape
    #[error("malformed document at {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures while loading or validating [`CallConfig`](crate::config::CallConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config from {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by call setup, hangup and transcription.
#[derive(Error, Debug)]
pub enum CallError {
    /// Join attempted with an unknown id, or the record carries no offer
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The record already holds an answer written by another party
    #[error("session {0} has already been answered")]
    SessionAlreadyAnswered(String),

    #[error("shared store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("shared store error: {0}")]
    Store(#[source] StoreError),

    /// Transcription requested but the remote stream carries no audio
    #[error("no audio track available in the remote stream")]
    NoAudioTrack,

    #[error("remote stream is not available")]
    NoRemoteStream,

    /// The transport rejected a session description
    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("transcription failed: {0}")]
    Transcription(String),

    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: CallState,
    },

    #[error("call is closed")]
    Closed,

    /// A remote description reached the transport twice
    #[error("remote description already applied")]
    DoubleApplyAttempted,
}

impl From<StoreError> for CallError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) | StoreError::NotFound(_) => {
                CallError::StoreUnavailable(err)
            }
            StoreError::Malformed { .. } | StoreError::Serialization(_) => CallError::Store(err),
        }
    }
}

impl CallError {
    /// Whether this error ends the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CallError::InvalidDescription(_))
    }
}
