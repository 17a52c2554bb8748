//! Signaling types and messages
//!
//! Wire types exchanged with the signaling channel. Messages that arrive
//! while the local peer is mid-reconnection are buffered in the persistence
//! store and replayed through `MediaTransport::apply_signaling` once the
//! connection is re-established.

use serde::{Deserialize, Serialize};

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// SDP offer from the remote peer
    Offer(SdpOffer),
    /// SDP answer from the remote peer
    Answer(SdpAnswer),
    /// Trickled ICE candidate
    Candidate(IceCandidate),
    /// Remote peer closed the connection
    Close,
}

impl SignalingMessage {
    /// Short kind tag used as the store's pending-signaling key
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer(_) => "offer",
            SignalingMessage::Answer(_) => "answer",
            SignalingMessage::Candidate(_) => "candidate",
            SignalingMessage::Close => "close",
        }
    }
}

/// SDP offer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpOffer {
    pub sdp: String,
}

impl SdpOffer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// SDP answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpAnswer {
    pub sdp: String,
    /// ICE candidates gathered alongside the answer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_candidates: Option<Vec<IceCandidate>>,
}

impl SdpAnswer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            ice_candidates: None,
        }
    }

    pub fn with_candidates(sdp: impl Into<String>, candidates: Vec<IceCandidate>) -> Self {
        Self {
            sdp: sdp.into(),
            ice_candidates: if candidates.is_empty() {
                None
            } else {
                Some(candidates)
            },
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_tags() {
        assert_eq!(SignalingMessage::Offer(SdpOffer::new("v=0")).kind(), "offer");
        assert_eq!(
            SignalingMessage::Candidate(IceCandidate::new("candidate:1")).kind(),
            "candidate"
        );
        assert_eq!(SignalingMessage::Close.kind(), "close");
    }

    #[test]
    fn test_candidate_wire_casing() {
        let candidate = IceCandidate::new("candidate:1").with_mid("0", 0);
        let json = serde_json::to_string(&candidate).unwrap();
        assert!(json.contains("sdpMid"));
        assert!(json.contains("sdpMLineIndex"));
    }

    #[test]
    fn test_message_tagged_serialization() {
        let msg = SignalingMessage::Answer(SdpAnswer::new("v=0"));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"answer""#));
        let back: SignalingMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), "answer");
    }
}
