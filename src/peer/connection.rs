use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::logger::dump_candidate;
use crate::peer::transport::{
    CandidateHandler, PeerTransport, StateHandler, TrackHandler, TransportFactory,
};
use crate::peer::types::{
    ConnectionState, IceCandidate, LocalTrack, RemoteTrack, SdpType, ServerConfig,
    SessionDescription, TrackKind,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// [`PeerTransport`] backed by a webrtc-rs `RTCPeerConnection`.
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    local_tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl WebRtcTransport {
    /// создаём Peer с медиа-движком и ICE серверами из конфигурации
    pub async fn new(config: &CallConfig) -> Result<Self> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| CallError::Transport(format!("registering codecs: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| CallError::Transport(format!("registering interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = api
            .new_peer_connection(rtc_config(config))
            .await
            .map_err(|e| CallError::Transport(format!("creating peer connection: {e}")))?;

        // Добавляем обработчик ICE gathering state для отладки
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!("ICE gathering state changed to: {:?}", state);
            Box::pin(async {})
        }));

        Ok(Self {
            pc: Arc::new(pc),
            local_tracks: Mutex::new(HashMap::new()),
        })
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Sample track created for a local capture track, for the capture to
    /// write media into.
    pub fn local_sample_track(&self, id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().get(id).cloned()
    }
}

/// Creates a [`WebRtcTransport`] for every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcTransportFactory;

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, config: &CallConfig) -> Result<Arc<dyn PeerTransport>> {
        Ok(Arc::new(WebRtcTransport::new(config).await?))
    }
}

/// Создает конфигурацию для peer connection
pub fn rtc_config(config: &CallConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(&config.ice_servers),
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.payload),
        SdpType::Answer => RTCSessionDescription::answer(desc.payload),
    };
    parsed.map_err(|e| CallError::InvalidDescription(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(CallError::Transport(format!(
            "unexpected local description type {other}"
        ))),
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

/// Only rejections of the description itself are fatal to the call; state
/// errors such as a closed connection stay transport errors.
fn remote_description_error(e: webrtc::Error) -> CallError {
    match e {
        webrtc::Error::Sdp(_)
        | webrtc::Error::ErrSessionDescriptionNoFingerprint
        | webrtc::Error::ErrSessionDescriptionInvalidFingerprint
        | webrtc::Error::ErrSessionDescriptionConflictingFingerprints
        | webrtc::Error::ErrSessionDescriptionMissingIceUfrag
        | webrtc::Error::ErrSessionDescriptionMissingIcePwd
        | webrtc::Error::ErrSessionDescriptionConflictingIceUfrag
        | webrtc::Error::ErrSessionDescriptionConflictingIcePwd => {
            CallError::InvalidDescription(e.to_string())
        }
        other => CallError::Transport(format!("setting remote description: {other}")),
    }
}

fn connection_state(st: RTCPeerConnectionState) -> ConnectionState {
    match st {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| CallError::Transport(format!("creating offer: {e}")))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| CallError::Transport(format!("creating answer: {e}")))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| CallError::Transport(format!("setting local description: {e}")))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(remote_description_error)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| CallError::Transport(format!("adding ICE candidate: {e}")))
    }

    async fn add_local_track(&self, track: &LocalTrack) -> Result<()> {
        let mime_type = match track.kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            track.stream_id.clone(),
        ));
        self.pc
            .add_track(Arc::clone(&sample_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| CallError::Media(format!("adding local track {}: {e}", track.id)))?;
        self.local_tracks
            .lock()
            .insert(track.id.clone(), sample_track);
        info!("added local {:?} track {}", track.kind, track.id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.local_tracks.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| CallError::Transport(format!("closing peer connection: {e}")))
    }

    fn on_local_candidate(&self, handler: CandidateHandler) {
        self.pc
            .on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            let candidate = from_rtc_candidate(init);
                            dump_candidate("LOCAL", &candidate);
                            handler(candidate);
                        }
                        Err(e) => debug!("Failed to get candidate JSON: {:?}", e),
                    },
                    // cand == None означает конец сбора
                    None => debug!("ICE candidate gathering completed (null candidate received)"),
                }
                Box::pin(async {})
            }));
    }

    fn on_remote_track(&self, handler: TrackHandler) {
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    handler(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    });
                }
                Box::pin(async {})
            },
        ));
    }

    fn on_connection_state_change(&self, handler: StateHandler) {
        self.pc
            .on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                debug!("Peer connection state changed to: {:?}", st);
                handler(connection_state(st));
                Box::pin(async {})
            }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtc_config_follows_call_config() {
        let mut config = CallConfig::default();
        config.ice_servers.push(ServerConfig {
            id: "relay".into(),
            r#type: "turn".into(),
            url: "turn.example.org:3478".into(),
            username: Some("user".into()),
            credential: Some("secret".into()),
        });

        let rtc = rtc_config(&config);
        assert_eq!(rtc.ice_candidate_pool_size, 10);
        assert_eq!(rtc.ice_servers.len(), 3);
        assert_eq!(rtc.ice_servers[2].urls, vec!["turn:turn.example.org:3478"]);
        assert_eq!(rtc.ice_servers[2].username, "user");
        assert_eq!(rtc.ice_servers[0].credential, "");
    }

    #[test]
    fn malformed_sdp_is_an_invalid_description() {
        // offer()/answer() parse the payload
        let err = to_rtc(SessionDescription::answer("not sdp")).unwrap_err();
        assert!(matches!(err, CallError::InvalidDescription(_)));
    }

    #[test]
    fn closed_connection_is_not_an_invalid_description() {
        let err = remote_description_error(webrtc::Error::ErrConnectionClosed);
        assert!(matches!(err, CallError::Transport(_)));
        assert!(!err.is_fatal());

        let err = remote_description_error(webrtc::Error::ErrSessionDescriptionNoFingerprint);
        assert!(matches!(err, CallError::InvalidDescription(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn states_map_one_to_one() {
        assert_eq!(
            connection_state(RTCPeerConnectionState::Connected),
            ConnectionState::Connected
        );
        assert_eq!(
            connection_state(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
    }
}
