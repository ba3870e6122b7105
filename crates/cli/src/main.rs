use std::process::ExitCode;

use clap::Parser;
use faceswap_cli::config::{CliArgs, FaceSwapConfig};
use faceswap_cli::pipeline::run_face_swap;
use faceswap_comfyui::session::token_hint;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "faceswap=info,faceswap_cli=info,faceswap_comfyui=info,faceswap_core=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // --- Configuration ---
    let config = FaceSwapConfig::from_args(CliArgs::parse());
    tracing::info!(
        server = %config.server,
        token = %config.token.as_deref().map(token_hint).unwrap_or_else(|| "none".into()),
        input = %config.input_image.display(),
        source = %config.source_image.display(),
        output = %config.output_image.display(),
        "Loaded configuration",
    );

    // --- Shutdown ---
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            ctrl_c_cancel.cancel();
        }
    });

    match run_face_swap(&config, &cancel).await {
        Ok(report) => {
            for failure in &report.failures {
                tracing::warn!(
                    node = %failure.node_id,
                    path = %failure.path.display(),
                    error = %failure.error,
                    "Image skipped",
                );
            }
            tracing::info!(
                prompt_id = %report.prompt_id,
                written = report.written.len(),
                discarded_frames = report.discarded_frames,
                from_history = report.from_history,
                "Face swap complete",
            );
            for path in &report.written {
                println!("{}", path.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(kind = ?e.kind(), error = %e, "Face swap failed");
            ExitCode::FAILURE
        }
    }
}
