//! Collected result payloads and the assembler that writes them to disk.
//!
//! [`ResultSet`] is filled incrementally while a job runs: every binary
//! payload is appended under the node that produced it. Once the job
//! completes, [`assemble`] decodes each payload and writes it next to
//! the requested output path (see [`crate::naming`]).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};

use crate::error::CoreError;
use crate::naming;

/// Encoded image payloads grouped by origin node, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    outputs: BTreeMap<String, Vec<Vec<u8>>>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one payload to the sequence of `node_id`.
    pub fn push(&mut self, node_id: &str, payload: Vec<u8>) {
        self.outputs
            .entry(node_id.to_string())
            .or_default()
            .push(payload);
    }

    /// Payloads produced by `node_id`, oldest first.
    pub fn images(&self, node_id: &str) -> Option<&[Vec<u8>]> {
        self.outputs.get(node_id).map(Vec::as_slice)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    /// Total number of payloads across all nodes.
    pub fn image_count(&self) -> usize {
        self.outputs.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.image_count() == 0
    }
}

impl IntoIterator for ResultSet {
    type Item = (String, Vec<Vec<u8>>);
    type IntoIter = std::collections::btree_map::IntoIter<String, Vec<Vec<u8>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.outputs.into_iter()
    }
}

/// One image that could not be written.
#[derive(Debug)]
pub struct ImageFailure {
    pub node_id: String,
    pub index: usize,
    pub path: PathBuf,
    pub error: CoreError,
}

/// What [`assemble`] wrote, and what it had to skip.
#[derive(Debug, Default)]
pub struct AssemblyReport {
    pub written: Vec<PathBuf>,
    pub failures: Vec<ImageFailure>,
}

/// Decode every payload in `results` and write it under `output`.
///
/// A payload that fails to decode or encode is recorded in
/// [`AssemblyReport::failures`] and does not stop its siblings. The call
/// fails only when nothing was written: an empty set yields
/// [`CoreError::NoOutput`], a fully failed one returns the first error.
pub fn assemble(results: ResultSet, output: &Path) -> Result<AssemblyReport, CoreError> {
    if results.is_empty() {
        return Err(CoreError::NoOutput("no images were received".into()));
    }

    let mut report = AssemblyReport::default();

    for (node_id, images) in results {
        let paths = naming::output_paths(output, images.len());
        for (index, (payload, path)) in images.into_iter().zip(paths).enumerate() {
            match save_image(&payload, &path) {
                Ok(()) => {
                    tracing::info!(node = %node_id, path = %path.display(), "Saved result image");
                    report.written.push(path);
                }
                Err(error) => {
                    tracing::warn!(
                        node = %node_id,
                        index,
                        bytes = payload.len(),
                        error = %error,
                        "Failed to write result image",
                    );
                    report.failures.push(ImageFailure {
                        node_id: node_id.clone(),
                        index,
                        path,
                        error,
                    });
                }
            }
        }
    }

    if report.written.is_empty() {
        return Err(report
            .failures
            .into_iter()
            .next()
            .map(|failure| failure.error)
            .unwrap_or_else(|| CoreError::NoOutput("no images were written".into())));
    }

    Ok(report)
}

/// Decode `payload` and encode it to `path`.
///
/// The encoder follows the extension of `path`; when the extension is not
/// a supported image format the payload's own format is kept.
fn save_image(payload: &[u8], path: &Path) -> Result<(), CoreError> {
    let decoded = image::load_from_memory(payload).map_err(|e| CoreError::Decode(e.to_string()))?;

    let format = match ImageFormat::from_path(path) {
        Ok(format) => format,
        Err(_) => image::guess_format(payload).map_err(|e| CoreError::Decode(e.to_string()))?,
    };

    // JPEG has no alpha channel.
    let decoded = if format == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(decoded.to_rgb8())
    } else {
        decoded
    };

    decoded.save_with_format(path, format).map_err(|e| match e {
        image::ImageError::IoError(io) => CoreError::Io(io),
        other => CoreError::Encode(other.to_string()),
    })
}
