//! HTTP side of the ComfyUI protocol.
//!
//! Covers the five endpoints a face swap run needs: image upload, prompt
//! submission, queue deletion, history lookup and output download. The
//! bearer token rides on every request and failures are split into
//! 401, other non-2xx statuses, and transport errors.

use std::time::Duration;

use faceswap_core::error::ErrorKind;
use faceswap_core::workflow::JobGraph;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// REST client bound to one server and one token.
pub struct ComfyUIApi {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

/// Body of a successful `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub prompt_id: String,
    /// Queue position at submission time.
    #[serde(default)]
    pub number: i32,
    /// Per-node warnings the server attached to an accepted graph.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// Body of a successful `POST /upload/image`.
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    /// Name the file is stored under; differs from the sent name only
    /// when the server had to rename it.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Network, TLS, timeout or body decoding failure.
    #[error("Request to ComfyUI failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ComfyUI rejected the credentials (401): {body}")]
    Unauthorized { body: String },

    #[error("ComfyUI answered {status}: {body}")]
    ApiError { status: u16, body: String },
}

impl ComfyUIApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ComfyUIApiError::Request(e) if e.is_decode() => ErrorKind::ProtocolViolation,
            ComfyUIApiError::Request(_) => ErrorKind::TransportFailure,
            ComfyUIApiError::Unauthorized { .. } => ErrorKind::Unauthorized,
            ComfyUIApiError::ApiError { .. } => ErrorKind::RemoteRejected,
        }
    }
}

impl ComfyUIApi {
    /// `api_url` is the HTTP base such as `http://host:8188`;
    /// `request_timeout` bounds each request including its body.
    pub fn new(
        api_url: String,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, ComfyUIApiError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            api_url,
            token,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Multipart upload of `bytes` under the `image` field.
    ///
    /// With `overwrite` the server replaces a same-named file rather than
    /// storing a renamed copy.
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        content_type: &str,
        overwrite: bool,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(content_type)?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("overwrite", overwrite.to_string());

        let response = self
            .request(Method::POST, "/upload/image")
            .multipart(form)
            .send()
            .await?;
        Self::json_body(response).await
    }

    /// Queue `graph` on behalf of `client_id`, whose event channel will
    /// receive the execution events.
    pub async fn submit_workflow(
        &self,
        graph: &JobGraph,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({ "prompt": graph, "client_id": client_id });
        let response = self.post_json("/prompt", &body).await?;
        Self::json_body(response).await
    }

    /// Remove `prompt_id` from the queue, interrupting it if it already runs.
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({ "delete": [prompt_id] });
        self.post_json("/queue", &body).await?;
        Ok(())
    }

    /// Raw `/history/{prompt_id}` record; `{}` while the prompt is unknown.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .request(Method::GET, &format!("/history/{prompt_id}"))
            .send()
            .await?;
        Self::json_body(response).await
    }

    /// Bytes of one stored file, addressed the way history records list it.
    pub async fn view_image(
        &self,
        filename: &str,
        subfolder: &str,
        kind: &str,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .request(Method::GET, "/view")
            .query(&[("filename", filename), ("subfolder", subfolder), ("type", kind)])
            .send()
            .await?;
        let response = Self::checked(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.api_url));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let response = self.request(Method::POST, path).json(body).send().await?;
        Self::checked(response).await
    }

    /// Pass 2xx responses through; turn anything else into an error
    /// carrying the response body.
    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        tracing::debug!(status = status.as_u16(), body = %body, "ComfyUI request rejected");

        if status == StatusCode::UNAUTHORIZED {
            return Err(ComfyUIApiError::Unauthorized { body });
        }
        Err(ComfyUIApiError::ApiError {
            status: status.as_u16(),
            body,
        })
    }

    async fn json_body<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        Ok(Self::checked(response).await?.json::<T>().await?)
    }
}
