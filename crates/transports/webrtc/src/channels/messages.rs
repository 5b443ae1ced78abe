//! Control channel message types
//!
//! Text frames carrying JSON objects tagged by `type`. Liveness uses
//! `ping`/`pong`; application state travels as `sync_status` and
//! `user_config` with opaque JSON bodies.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest control message accepted for sending (SCTP message limit)
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Message exchanged over the control data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Liveness probe; the receiver answers with a pong immediately
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Answer to a ping, echoing its timestamp
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Peer-specific settings pushed by the remote user
    UserConfig { config: serde_json::Value },

    /// Application state snapshot
    SyncStatus { status: serde_json::Value },
}

impl ControlMessage {
    /// Ping stamped with the current wall-clock time in milliseconds
    pub fn ping_now() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .ok();
        ControlMessage::Ping { timestamp }
    }

    /// Wire `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Ping { .. } => "ping",
            ControlMessage::Pong { .. } => "pong",
            ControlMessage::UserConfig { .. } => "user_config",
            ControlMessage::SyncStatus { .. } => "sync_status",
        }
    }

    pub fn to_text(&self) -> Result<String> {
        let text = serde_json::to_string(self)?;
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(Error::DataChannelError(format!(
                "Message size {} exceeds maximum {} bytes",
                text.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        Ok(text)
    }

    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// `type` tag of a text frame, if it is a JSON object carrying one
pub fn message_type(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_tags() {
        let pong = ControlMessage::Pong {
            timestamp: Some(1_700_000_000_123),
        };
        assert_eq!(
            pong.to_text().unwrap(),
            r#"{"type":"pong","timestamp":1700000000123}"#
        );

        let sync = ControlMessage::SyncStatus {
            status: json!({ "muted": true }),
        };
        let value: serde_json::Value = serde_json::from_str(&sync.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "sync_status");
        assert_eq!(value["status"]["muted"], true);
    }

    #[test]
    fn test_ping_without_timestamp() {
        let msg = ControlMessage::from_text(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Ping { timestamp: None });
        assert!(matches!(
            ControlMessage::ping_now(),
            ControlMessage::Ping { timestamp: Some(_) }
        ));
    }

    #[test]
    fn test_unknown_type() {
        let text = r#"{"type":"cursor","x":3}"#;
        assert!(ControlMessage::from_text(text).is_err());
        assert_eq!(message_type(text).as_deref(), Some("cursor"));
        assert_eq!(message_type("not json"), None);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let msg = ControlMessage::UserConfig {
            config: json!("x".repeat(MAX_MESSAGE_SIZE)),
        };
        assert!(matches!(msg.to_text(), Err(Error::DataChannelError(_))));
    }
}
