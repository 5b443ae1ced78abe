//! Signaling message types
//!
//! JSON objects tagged by `type`. Every message carries the sender's overlay
//! addresses; descriptions and candidates use the browser's field names so
//! non-Rust peers can take part.

use crate::session::SessionIdentifier;
use crate::{Error, Result};
use peermux_core::PeerAddress;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Addresses of the node that sent a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    pub ipv4: PeerAddress,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
}

impl SenderInfo {
    pub fn new(ipv4: PeerAddress) -> Self {
        Self { ipv4, ipv6: None }
    }
}

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as `{ type, sdp }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,

    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn from_rtc(desc: &RTCSessionDescription) -> Result<Self> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            RTCSdpType::Pranswer => SdpKind::Pranswer,
            RTCSdpType::Rollback => SdpKind::Rollback,
            RTCSdpType::Unspecified => {
                return Err(Error::SdpError(
                    "Local description has no SDP type".to_string(),
                ))
            }
        };
        Ok(Self {
            kind,
            sdp: desc.sdp.clone(),
        })
    }

    pub fn to_rtc(&self) -> Result<RTCSessionDescription> {
        let sdp = self.sdp.clone();
        match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(sdp),
            SdpKind::Rollback => {
                return Err(Error::SdpError(
                    "Rollback descriptions are not exchanged".to_string(),
                ))
            }
        }
        .map_err(|e| Error::SdpError(format!("Failed to parse {:?} SDP: {}", self.kind, e)))
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,

    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,

    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,

    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

/// Message exchanged over the signaling relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Session identifier exchange; the receiver replies with its own
    Uuid {
        sender: SenderInfo,
        uuid: SessionIdentifier,
    },

    /// Answerer asks the offerer to restart its offer flow
    AskOffer { sender: SenderInfo },

    /// Local offer plus every candidate gathered for it
    OfferWithCandidates {
        sender: SenderInfo,
        offer: SessionDescription,
        candidates: Vec<IceCandidate>,
    },

    /// Local answer plus every candidate gathered for it
    AnswerWithCandidates {
        sender: SenderInfo,
        answer: SessionDescription,
        candidates: Vec<IceCandidate>,
    },
}

impl SignalingMessage {
    pub fn sender(&self) -> &SenderInfo {
        match self {
            SignalingMessage::Uuid { sender, .. }
            | SignalingMessage::AskOffer { sender }
            | SignalingMessage::OfferWithCandidates { sender, .. }
            | SignalingMessage::AnswerWithCandidates { sender, .. } => sender,
        }
    }

    /// Wire `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Uuid { .. } => "uuid",
            SignalingMessage::AskOffer { .. } => "ask-offer",
            SignalingMessage::OfferWithCandidates { .. } => "offer-with-candidates",
            SignalingMessage::AnswerWithCandidates { .. } => "answer-with-candidates",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sender() -> SenderInfo {
        SenderInfo::new(PeerAddress::new("100.64.0.1"))
    }

    #[test]
    fn test_offer_wire_form() {
        let msg = SignalingMessage::OfferWithCandidates {
            sender: sender(),
            offer: SessionDescription::offer("v=0"),
            candidates: vec![IceCandidate::new("candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host")],
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "offer-with-candidates");
        assert_eq!(value["sender"], json!({ "ipv4": "100.64.0.1" }));
        assert_eq!(value["offer"], json!({ "type": "offer", "sdp": "v=0" }));
        assert_eq!(value["candidates"][0]["sdpMid"], "0");
        assert_eq!(value["candidates"][0]["sdpMLineIndex"], 0);

        assert_eq!(SignalingMessage::from_json(&msg.to_json().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_parses_browser_message() {
        let msg = SignalingMessage::from_json(
            r#"{
                "type": "answer-with-candidates",
                "sender": { "ipv4": "100.64.0.2", "ipv6": "fd7a:115c:a1e0::2" },
                "answer": { "type": "answer", "sdp": "v=0\r\n" },
                "candidates": [
                    { "candidate": "candidate:2 1 udp 1 10.0.0.2 6000 typ host",
                      "sdpMid": "0", "sdpMLineIndex": 0, "usernameFragment": "abcd" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(msg.kind(), "answer-with-candidates");
        assert_eq!(msg.sender().ipv4.as_str(), "100.64.0.2");
        assert_eq!(msg.sender().ipv6.as_deref(), Some("fd7a:115c:a1e0::2"));
        let SignalingMessage::AnswerWithCandidates { candidates, .. } = msg else {
            panic!("wrong variant");
        };
        assert_eq!(candidates[0].username_fragment.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_uuid_and_ask_offer() {
        let uuid = SignalingMessage::from_json(
            r#"{"type":"uuid","sender":{"ipv4":"100.64.0.3"},"uuid":"1718000000000000042"}"#,
        )
        .unwrap();
        assert!(matches!(
            uuid,
            SignalingMessage::Uuid { uuid, .. } if uuid == SessionIdentifier::new(1_718_000_000_000_000_042)
        ));

        let ask = SignalingMessage::AskOffer { sender: sender() };
        assert_eq!(
            ask.to_json().unwrap(),
            r#"{"type":"ask-offer","sender":{"ipv4":"100.64.0.1"}}"#
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = SignalingMessage::from_json(r#"{"type":"hello","sender":{"ipv4":"1.2.3.4"}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::SerializationError(_)));
    }

    #[test]
    fn test_description_conversion() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";
        assert!(SessionDescription::answer(sdp).to_rtc().is_ok());
        assert!(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new()
        }
        .to_rtc()
        .is_err());
    }
}
