use std::fmt;
use std::time::Duration;

/// ========== CALL STATE ==========

/// Position of one party in the offer/answer handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    New,
    /// Caller: local offer set and persisted
    OfferCreated,
    /// Caller: watching the record for an answer
    AwaitingAnswer,
    /// Caller: answer applied as remote description
    AnswerApplied,
    /// Callee: offer applied as remote description
    OfferApplied,
    /// Callee: answer set locally and persisted
    AnswerSent,
    Connected,
    Closed,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Closed | CallState::Failed)
    }

    /// Whether the transport should already hold a remote description here.
    pub fn has_remote_description(self) -> bool {
        matches!(
            self,
            CallState::AnswerApplied
                | CallState::OfferApplied
                | CallState::AnswerSent
                | CallState::Connected
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which side of the call this coordinator plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Explicit record of whether the remote description reached the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemoteDescription {
    #[default]
    Unset,
    Applied,
}

/// ========== CONSTANTS ==========

/// Период ожидания перед переходом в Failed после Disconnected
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Default length of a transcription window.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(5000);
