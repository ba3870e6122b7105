//! One face swap run from local files to saved result images.

use std::path::{Path, PathBuf};

use faceswap_comfyui::history::collect_history_results;
use faceswap_comfyui::monitor::{run_execution, MonitorConfig};
use faceswap_comfyui::session::{ClientSession, ServerEndpoint};
use faceswap_comfyui::upload::upload_asset;
use faceswap_core::error::CoreError;
use faceswap_core::results::{assemble, ImageFailure};
use faceswap_core::workflow::WorkflowTemplate;
use tokio_util::sync::CancellationToken;

use crate::config::FaceSwapConfig;
use crate::error::FaceSwapError;

/// Summary of a successful run.
#[derive(Debug)]
pub struct FaceSwapReport {
    pub prompt_id: String,
    /// Files written, in node then arrival order.
    pub written: Vec<PathBuf>,
    /// Images that could not be decoded or saved.
    pub failures: Vec<ImageFailure>,
    /// Binary frames dropped because no node was executing.
    pub discarded_frames: usize,
    /// Whether the images came from the prompt history instead of the
    /// WebSocket stream.
    pub from_history: bool,
}

/// Upload both images, run the face swap workflow and save its outputs
/// to `config.output_image`.
///
/// Local inputs are checked before any request is made. Cancelling
/// before submission stops the run without queueing anything.
pub async fn run_face_swap(
    config: &FaceSwapConfig,
    cancel: &CancellationToken,
) -> Result<FaceSwapReport, FaceSwapError> {
    let template = load_template(config).await?;

    for path in [&config.input_image, &config.source_image] {
        match tokio::fs::try_exists(path).await {
            Ok(true) => {}
            Ok(false) => return Err(CoreError::NotFound(path.clone()).into()),
            Err(e) => return Err(CoreError::Io(e).into()),
        }
    }

    let endpoint = ServerEndpoint::parse(&config.server)?;
    let session = ClientSession::new(endpoint, config.token.clone());
    let api = session.api(config.request_timeout)?;

    tracing::info!(
        api_url = %session.endpoint().api_url(),
        client_id = %session.client_id(),
        "Starting face swap",
    );

    let uploads = async {
        tokio::try_join!(
            upload_asset(&api, &config.input_image),
            upload_asset(&api, &config.source_image),
        )
    };
    let (input_name, source_name) = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::info!("Cancelled during upload, nothing submitted");
            return Err(FaceSwapError::Cancelled);
        }
        uploaded = uploads => uploaded?,
    };

    let graph = template.build(&input_name, &source_name);

    let monitor_config = MonitorConfig {
        idle_timeout: config.idle_timeout,
    };
    let outcome = run_execution(&session, &api, &graph, &monitor_config, cancel).await?;

    let mut results = outcome.results;
    let mut from_history = false;

    if results.is_empty() && outcome.execution_error.is_none() && config.history_fallback {
        tracing::info!(prompt_id = %outcome.prompt_id, "No streamed images, checking history");
        results = collect_history_results(&api, &outcome.prompt_id).await?;
        from_history = !results.is_empty();
    }

    if results.is_empty() {
        if let Some(error) = outcome.execution_error {
            return Err(FaceSwapError::Execution {
                node_id: error.node_id,
                node_type: error.node_type,
                message: error.exception_message,
            });
        }
    }

    ensure_parent_dir(&config.output_image).await?;
    let report = assemble(results, &config.output_image)?;

    Ok(FaceSwapReport {
        prompt_id: outcome.prompt_id,
        written: report.written,
        failures: report.failures,
        discarded_frames: outcome.discarded_frames,
        from_history,
    })
}

async fn load_template(config: &FaceSwapConfig) -> Result<WorkflowTemplate, CoreError> {
    let Some(path) = &config.workflow else {
        return WorkflowTemplate::new(
            WorkflowTemplate::face_swap()?.graph().clone(),
            config.input_node.as_str(),
            config.source_node.as_str(),
        );
    };

    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CoreError::NotFound(path.clone()));
        }
        Err(e) => return Err(e.into()),
    };
    tracing::debug!(path = %path.display(), "Loaded workflow template");
    WorkflowTemplate::from_json(&json, &config.input_node, &config.source_node)
}

async fn ensure_parent_dir(output: &Path) -> Result<(), CoreError> {
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            tokio::fs::create_dir_all(parent).await?;
            Ok(())
        }
        _ => Ok(()),
    }
}
