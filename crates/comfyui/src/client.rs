//! Event channel handshake.
//!
//! The channel is a WebSocket at `{ws_url}/ws?clientId=...`. Events for
//! every prompt submitted with the same client id are pushed to it, so
//! it must be open before the prompt is queued.

use faceswap_core::error::ErrorKind;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type ComfyUIStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Where and how to open the event channel.
pub struct ComfyUIClient {
    ws_url: String,
    token: Option<String>,
}

/// An open event channel.
#[derive(Debug)]
pub struct ComfyUIConnection {
    pub client_id: String,
    pub ws_stream: ComfyUIStream,
}

impl ComfyUIClient {
    /// `ws_url` is the WebSocket base such as `wss://host:8188`.
    pub fn new(ws_url: String, token: Option<String>) -> Self {
        Self { ws_url, token }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Perform the handshake for `client_id`, sending the bearer token
    /// as an `Authorization` header when one is configured.
    pub async fn connect(&self, client_id: &str) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={client_id}", self.ws_url);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ComfyUIClientError::Connection(format!("invalid URL {url}: {e}")))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                ComfyUIClientError::Connection(format!("token is not a valid header value: {e}"))
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _response) = connect_async(request).await.map_err(|e| match e {
            WsError::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
                ComfyUIClientError::Unauthorized
            }
            other => ComfyUIClientError::Connection(format!("{}: {other}", self.ws_url)),
        })?;

        tracing::info!(client_id = %client_id, ws_url = %self.ws_url, "Event channel open");

        Ok(ComfyUIConnection {
            client_id: client_id.to_string(),
            ws_stream,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    #[error("ComfyUI rejected the WebSocket credentials (401)")]
    Unauthorized,

    #[error("Failed to open WebSocket: {0}")]
    Connection(String),
}

impl ComfyUIClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ComfyUIClientError::Unauthorized => ErrorKind::Unauthorized,
            ComfyUIClientError::Connection(_) => ErrorKind::TransportFailure,
        }
    }
}
