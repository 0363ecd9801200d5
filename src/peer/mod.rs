pub mod connection;
pub mod coordinator;
pub mod ice;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{WebRtcTransport, WebRtcTransportFactory};
pub use coordinator::NegotiationCoordinator;
pub use ice::{CandidateRelay, Ingest};
pub use state::{CallState, Role};
pub use transport::{PeerTransport, TransportFactory};
pub use types::{
    ConnectionState, IceCandidate, LocalTrack, RemoteTrack, SdpType, ServerConfig,
    SessionDescription, TrackKind,
};
