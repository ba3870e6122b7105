use faceswap_comfyui::api::ComfyUIApiError;
use faceswap_comfyui::history::HistoryError;
use faceswap_comfyui::monitor::MonitorError;
use faceswap_comfyui::upload::AssetUploadError;
use faceswap_core::error::{CoreError, ErrorKind};

/// Any failure of a face swap run.
#[derive(Debug, thiserror::Error)]
pub enum FaceSwapError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Upload(#[from] AssetUploadError),

    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    History(#[from] HistoryError),

    /// Cancelled before the job graph was submitted.
    #[error("Cancelled before submission")]
    Cancelled,

    /// The server reported a node failure and produced no image.
    #[error("Node {node_id} ({node_type}) failed: {message}")]
    Execution {
        node_id: String,
        node_type: String,
        message: String,
    },
}

impl FaceSwapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FaceSwapError::Core(e) => e.kind(),
            FaceSwapError::Upload(e) => e.kind(),
            FaceSwapError::Api(e) => e.kind(),
            FaceSwapError::Monitor(e) => e.kind(),
            FaceSwapError::History(e) => e.kind(),
            FaceSwapError::Cancelled => ErrorKind::TransportFailure,
            FaceSwapError::Execution { .. } => ErrorKind::RemoteRejected,
        }
    }
}
