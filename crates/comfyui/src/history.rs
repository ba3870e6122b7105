//! Result collection from the prompt history.
//!
//! Workflows that save through a regular `SaveImage` node instead of a
//! websocket output node never push binary frames. Their images are
//! listed under `/history/{prompt_id}` once the prompt has finished and
//! can be downloaded through `/view`.

use std::collections::BTreeMap;

use faceswap_core::error::ErrorKind;
use faceswap_core::results::ResultSet;
use serde::Deserialize;

use crate::api::{ComfyUIApi, ComfyUIApiError};

/// Folder kind of final (non-preview) outputs.
const OUTPUT_KIND: &str = "output";

/// One file listed in a history record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    outputs: BTreeMap<String, NodeOutput>,
}

#[derive(Debug, Deserialize)]
struct NodeOutput {
    #[serde(default)]
    images: Vec<ImageRef>,
}

/// Errors from [`collect_history_results`].
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error("Malformed history record: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl HistoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HistoryError::Api(e) => e.kind(),
            HistoryError::Malformed(_) => ErrorKind::ProtocolViolation,
        }
    }
}

/// Final output images of `prompt_id` listed in a `/history` response,
/// as `(node_id, image)` pairs ordered by node id, the same order a
/// [`ResultSet`] iterates in. Temporary previews are skipped.
pub fn output_images(
    history: &serde_json::Value,
    prompt_id: &str,
) -> Result<Vec<(String, ImageRef)>, serde_json::Error> {
    let Some(entry) = history.get(prompt_id) else {
        return Ok(Vec::new());
    };
    let entry: HistoryEntry = serde_json::from_value(entry.clone())?;

    Ok(entry
        .outputs
        .into_iter()
        .flat_map(|(node_id, output)| {
            output
                .images
                .into_iter()
                .filter(|image| image.kind == OUTPUT_KIND)
                .map(move |image| (node_id.clone(), image))
        })
        .collect())
}

/// Download every final output image of `prompt_id` into a [`ResultSet`].
pub async fn collect_history_results(
    api: &ComfyUIApi,
    prompt_id: &str,
) -> Result<ResultSet, HistoryError> {
    let history = api.get_history(prompt_id).await?;
    let images = output_images(&history, prompt_id)?;

    tracing::info!(prompt_id = %prompt_id, count = images.len(), "Fetching outputs from history");

    let mut results = ResultSet::new();
    for (node_id, image) in images {
        let bytes = api
            .view_image(&image.filename, &image.subfolder, &image.kind)
            .await?;
        tracing::debug!(node = %node_id, filename = %image.filename, bytes = bytes.len(), "Downloaded output");
        results.push(&node_id, bytes);
    }
    Ok(results)
}
