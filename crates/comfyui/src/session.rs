//! Server endpoint resolution and per-job client sessions.
//!
//! A [`ClientSession`] is created for every job. It owns the
//! caller-generated `client_id` that ties the WebSocket channel to the
//! events the server pushes for the submitted prompt, so it must never
//! be reused across jobs.

use std::time::Duration;

use faceswap_core::error::CoreError;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::client::ComfyUIClient;

/// HTTP and WebSocket base URLs of one ComfyUI server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    api_url: String,
    ws_url: String,
}

impl ServerEndpoint {
    /// Resolve a `--server` value into base URLs.
    ///
    /// A bare `host[:port]` defaults to TLS (`https://` + `wss://`). An
    /// explicit `http://`, `https://`, `ws://` or `wss://` prefix selects
    /// the scheme pair. Trailing slashes are dropped.
    pub fn parse(server: &str) -> Result<Self, CoreError> {
        let server = server.trim();

        let (secure, host) = if let Some(host) = server.strip_prefix("https://") {
            (true, host)
        } else if let Some(host) = server.strip_prefix("http://") {
            (false, host)
        } else if let Some(host) = server.strip_prefix("wss://") {
            (true, host)
        } else if let Some(host) = server.strip_prefix("ws://") {
            (false, host)
        } else {
            (true, server)
        };
        let host = host.trim_end_matches('/');

        if host.is_empty() {
            return Err(CoreError::Validation(format!(
                "server address `{server}` has no host"
            )));
        }

        let (http, ws) = if secure { ("https", "wss") } else { ("http", "ws") };
        Ok(Self {
            api_url: format!("{http}://{host}"),
            ws_url: format!("{ws}://{host}"),
        })
    }

    /// HTTP base URL, e.g. `https://host:8188`.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// WebSocket base URL, e.g. `wss://host:8188`.
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }
}

/// Identity and credentials for one job submission.
#[derive(Debug, Clone)]
pub struct ClientSession {
    client_id: String,
    endpoint: ServerEndpoint,
    token: Option<String>,
}

impl ClientSession {
    /// Start a session with a fresh UUID v4 `client_id`.
    pub fn new(endpoint: ServerEndpoint, token: Option<String>) -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            endpoint,
            token,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// REST client bound to this session's server and token.
    pub fn api(&self, request_timeout: Duration) -> Result<ComfyUIApi, ComfyUIApiError> {
        ComfyUIApi::new(
            self.endpoint.api_url().to_string(),
            self.token.clone(),
            request_timeout,
        )
    }

    /// WebSocket client bound to this session's server and token.
    pub fn ws_client(&self) -> ComfyUIClient {
        ComfyUIClient::new(self.endpoint.ws_url().to_string(), self.token.clone())
    }
}

/// Shorten a bearer token for log output (first 8 characters).
pub fn token_hint(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{prefix}...")
}
