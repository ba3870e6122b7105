//! Upload of local image assets to the ComfyUI input folder.

use std::path::{Path, PathBuf};

use faceswap_core::error::ErrorKind;

use crate::api::{ComfyUIApi, ComfyUIApiError};

/// Errors from [`upload_asset`].
#[derive(Debug, thiserror::Error)]
pub enum AssetUploadError {
    /// The local file does not exist.
    #[error("Asset not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The local file exists but could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The upload request failed.
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),
}

impl AssetUploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AssetUploadError::NotFound(_) => ErrorKind::NotFound,
            AssetUploadError::Read { .. } => ErrorKind::Io,
            AssetUploadError::Api(e) => e.kind(),
        }
    }
}

/// MIME type sent with an upload, chosen from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

/// Upload the file at `path` and return the name the server stored it under.
///
/// The file must exist locally; a missing file fails with
/// [`AssetUploadError::NotFound`] before any request is made. Uploads
/// always overwrite, so repeated runs with the same file reuse one
/// server-side name instead of accumulating renamed copies.
pub async fn upload_asset(api: &ComfyUIApi, path: &Path) -> Result<String, AssetUploadError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AssetUploadError::NotFound(path.to_path_buf()));
        }
        Err(source) => {
            return Err(AssetUploadError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| AssetUploadError::NotFound(path.to_path_buf()))?;

    tracing::debug!(path = %path.display(), bytes = bytes.len(), "Uploading asset");

    let response = api
        .upload_image(bytes, &filename, content_type_for(path), true)
        .await?;
    let stored = response.name.unwrap_or_else(|| filename.clone());

    if stored != filename {
        tracing::warn!(local = %filename, stored = %stored, "Server renamed uploaded asset");
    }
    tracing::info!(path = %path.display(), stored = %stored, "Uploaded asset");

    Ok(stored)
}
