use crate::config::CallConfig;
use crate::error::Result;
use crate::peer::types::{ConnectionState, IceCandidate, LocalTrack, RemoteTrack, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;

pub type CandidateHandler = Box<dyn Fn(IceCandidate) + Send + Sync>;
pub type TrackHandler = Box<dyn Fn(RemoteTrack) + Send + Sync>;
pub type StateHandler = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// The real-time connection object negotiated by a coordinator.
///
/// Implementations own encryption, NAT traversal and media transport.
/// `set_remote_description` reports a rejected payload as
/// [`CallError::InvalidDescription`](crate::error::CallError::InvalidDescription).
/// Hooks replace any previously installed handler and must only forward.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_local_track(&self, track: &LocalTrack) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn on_local_candidate(&self, handler: CandidateHandler);

    fn on_remote_track(&self, handler: TrackHandler);

    fn on_connection_state_change(&self, handler: StateHandler);
}

/// Builds one fresh transport per call.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, config: &CallConfig) -> Result<Arc<dyn PeerTransport>>;
}
