//! Signaling between peers
//!
//! Signaling is point-to-point: a message is delivered to one peer address
//! and may produce a direct reply. Only the session identifier exchange uses
//! the reply; everything else is fire-and-forget.

pub mod messages;
pub mod server;

pub use messages::{IceCandidate, SdpKind, SenderInfo, SessionDescription, SignalingMessage};
pub use server::SignalingServer;

use crate::{Error, Result};
use async_trait::async_trait;
use peermux_core::PeerAddress;
use std::time::Duration;
use tracing::{debug, trace};

/// Path the signaling endpoint is mounted at
pub const SIGNAL_PATH: &str = "/signal";

/// Outbound side of the signaling relay
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Deliver `message` to `to`, returning the peer's reply if it sent one
    ///
    /// # Errors
    ///
    /// `SignalingDeliveryFailure` when the peer cannot be reached.
    async fn send(
        &self,
        to: &PeerAddress,
        message: &SignalingMessage,
    ) -> Result<Option<SignalingMessage>>;
}

/// Inbound side: whatever receives signaling messages for this node
#[async_trait]
pub trait SignalHandler: Send + Sync {
    /// Handle one inbound message, optionally producing a direct reply
    async fn handle_signal(&self, message: SignalingMessage) -> Result<Option<SignalingMessage>>;
}

/// Relay that POSTs JSON to each peer's signaling endpoint
#[derive(Clone)]
pub struct HttpSignalingRelay {
    client: reqwest::Client,
    port: u16,
}

impl HttpSignalingRelay {
    pub fn new(port: u16, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, port })
    }

    /// Endpoint URL for a peer
    pub fn endpoint(&self, peer: &PeerAddress) -> String {
        format!("http://{}:{}{}", peer, self.port, SIGNAL_PATH)
    }
}

#[async_trait]
impl SignalingRelay for HttpSignalingRelay {
    async fn send(
        &self,
        to: &PeerAddress,
        message: &SignalingMessage,
    ) -> Result<Option<SignalingMessage>> {
        trace!("Sending {} to {}", message.kind(), to);

        let response = self
            .client
            .post(self.endpoint(to))
            .json(message)
            .send()
            .await
            .map_err(|e| {
                Error::SignalingDeliveryFailure(format!("{} to {}: {}", message.kind(), to, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::SignalingDeliveryFailure(format!(
                "{} to {} returned HTTP {}",
                message.kind(),
                to,
                status
            )));
        }

        let body = response.bytes().await.map_err(|e| {
            Error::SignalingDeliveryFailure(format!("Reading reply from {}: {}", to, e))
        })?;
        if body.is_empty() {
            return Ok(None);
        }

        match serde_json::from_slice::<SignalingMessage>(&body) {
            Ok(reply) => Ok(Some(reply)),
            Err(e) => {
                debug!("Ignoring non-signaling reply from {}: {}", to, e);
                Ok(None)
            }
        }
    }
}
