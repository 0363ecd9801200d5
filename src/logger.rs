use crate::config::LogConfig;
use crate::peer::state::CallState;
use crate::peer::types::{IceCandidate, RemoteTrack};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

/// Логирование с временными метками
///
/// `RUST_LOG` takes precedence over the configured filter. Safe to call more
/// than once; only the first subscriber is installed.
pub fn init_logging(config: &LogConfig) {
    if !config.enabled {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.as_str()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
        .with_target(false)
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index, cand.username_fragment
    );
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateCounts {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateCounts {
    let mut counts = CandidateCounts::default();

    for candidate in candidates {
        match candidate.candidate_type() {
            Some("host") => counts.host += 1,
            Some("srflx") => counts.srflx += 1,
            Some("relay") => counts.relay += 1,
            _ => {}
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        counts.host, counts.srflx, counts.relay
    );

    if counts.relay == 0 {
        warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }
    counts
}

/// Events published to whoever drives the call (UI, CLI, tests).
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged(CallState),
    Connected,
    ConnectionProblem,
    Recovered,
    ConnectionFailed,
    RemoteTrack(RemoteTrack),
    /// A candidate could not be published or applied; the call continues
    CandidateError(String),
    Closed,
}

/// Fan-out of [`CallEvent`]s for one call.
#[derive(Debug, Clone)]
pub struct Emitter {
    tx: broadcast::Sender<CallEvent>,
}

impl Emitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, evt: CallEvent) {
        debug!("emit {:?}", evt);
        // no subscribers is fine
        let _ = self.tx.send(evt);
    }

    pub fn emit_connected(&self) {
        self.emit(CallEvent::Connected);
    }

    pub fn emit_connection_problem(&self) {
        warn!("connection issues detected");
        self.emit(CallEvent::ConnectionProblem);
    }

    pub fn emit_connection_recovered(&self) {
        info!("connection recovered");
        self.emit(CallEvent::Recovered);
    }

    pub fn emit_connection_failed(&self) {
        warn!("connection recovery failed");
        self.emit(CallEvent::ConnectionFailed);
    }

    pub fn emit_candidate_error(&self, msg: String) {
        warn!("{msg}");
        self.emit(CallEvent::CandidateError(msg));
    }

    pub fn emit_closed(&self) {
        self.emit(CallEvent::Closed);
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new(64)
    }
}
