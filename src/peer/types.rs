use serde::{Deserialize, Serialize};
use std::fmt;

/// Тип SDP в записи сессии
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

/// Session description as stored in the call record: `{type, payload}`.
///
/// Browser clients write `RTCSessionDescription.toJSON()`, which names the
/// payload `sdp`; both spellings are accepted on read.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    #[serde(alias = "sdp")]
    pub payload: String,
}

impl SessionDescription {
    pub fn offer(payload: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            payload: payload.into(),
        }
    }

    pub fn answer(payload: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            payload: payload.into(),
        }
    }
}

/// ICE кандидат, как он лежит в коллекции кандидатов
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid,
            sdp_mline_index,
            username_fragment: None,
        }
    }

    /// Candidate type token (`host`, `srflx`, `prflx`, `relay`) if present.
    pub fn candidate_type(&self) -> Option<&str> {
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return parts.next();
            }
        }
        None
    }
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A track produced by local capture and offered to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// A track announced by the transport's remote-track hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Connection state reported by the transport object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn description_accepts_browser_sdp_field() {
        let desc: SessionDescription =
            serde_json::from_value(json!({"type": "offer", "sdp": "v=0\r\n"})).unwrap();
        assert_eq!(desc, SessionDescription::offer("v=0\r\n"));

        let written = serde_json::to_value(&desc).unwrap();
        assert_eq!(written, json!({"type": "offer", "payload": "v=0\r\n"}));
    }

    #[test]
    fn candidate_wire_shape() {
        let cand = IceCandidate::new(
            "candidate:1 1 udp 2122260223 192.168.1.2 54400 typ host",
            Some("0".into()),
            Some(0),
        );
        let value = serde_json::to_value(&cand).unwrap();
        assert_eq!(
            value,
            json!({
                "candidate": "candidate:1 1 udp 2122260223 192.168.1.2 54400 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            })
        );
        assert_eq!(cand.candidate_type(), Some("host"));
    }

    #[test]
    fn candidate_nullable_fields() {
        let cand: IceCandidate =
            serde_json::from_value(json!({"candidate": "c", "sdpMid": null, "sdpMLineIndex": null}))
                .unwrap();
        assert_eq!(cand.sdp_mid, None);
        assert_eq!(cand.sdp_mline_index, None);
        assert_eq!(cand.candidate_type(), None);
    }
}
