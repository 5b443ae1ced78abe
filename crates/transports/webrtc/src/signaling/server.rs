//! HTTP signaling endpoint
//!
//! - POST /signal - deliver one signaling message, reply in the body if any
//! - GET /health - health check

use super::{SignalHandler, SignalingMessage, SIGNAL_PATH};
use crate::{Error, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Server state shared across handlers
#[derive(Clone)]
struct ServerState {
    handler: Arc<dyn SignalHandler>,
}

/// Accepts signaling messages from peers and hands them to a [`SignalHandler`]
pub struct SignalingServer {
    bind_address: String,
    state: ServerState,
}

impl SignalingServer {
    /// Create a server
    ///
    /// # Arguments
    ///
    /// * `bind_address` - Address to bind to (e.g., "0.0.0.0:8848")
    /// * `handler` - Receiver of inbound messages, usually the dispatcher
    pub fn new(bind_address: impl Into<String>, handler: Arc<dyn SignalHandler>) -> Self {
        Self {
            bind_address: bind_address.into(),
            state: ServerState { handler },
        }
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    /// Build the router with all endpoints
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route(SIGNAL_PATH, post(signal_handler))
            .with_state(self.state.clone())
            .layer(tower_http::trace::TraceLayer::new_for_http())
    }

    /// Bind and serve until the task is dropped
    pub async fn serve(self) -> Result<()> {
        let addr: SocketAddr = self
            .bind_address
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("Invalid bind address: {}", e)))?;

        let listener = TcpListener::bind(addr).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve_on(self, listener: TcpListener) -> Result<()> {
        info!("Signaling endpoint listening on {}", listener.local_addr()?);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn signal_handler(
    State(state): State<ServerState>,
    Json(message): Json<SignalingMessage>,
) -> Response {
    let kind = message.kind();
    let sender = message.sender().ipv4.clone();
    debug!("Received {} from {}", kind, sender);

    match state.handler.handle_signal(message).await {
        Ok(Some(reply)) => Json(reply).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!("Failed to handle {} from {}: {}", kind, sender, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
