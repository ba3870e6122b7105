//! Command-line arguments and resolved run configuration.
//!
//! # Environment variables
//!
//! | Variable                    | Default                 | Description                                  |
//! |-----------------------------|-------------------------|----------------------------------------------|
//! | `COMFYUI_SERVER`            | `http://127.0.0.1:8188` | Server address when `--server` is absent     |
//! | `COMFYUI_TOKEN`             | --                      | Bearer token when `--token` is absent        |
//! | `WEB_TOKEN`                 | --                      | Second fallback for the bearer token         |
//! | `COMFYUI_IDLE_TIMEOUT_SECS` | `600`                   | Max seconds between WebSocket frames (0 = off) |
//! | `COMFYUI_REQUEST_TIMEOUT_SECS` | `60`                 | Per-request HTTP timeout                     |

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use faceswap_core::workflow::{DEFAULT_INPUT_NODE, DEFAULT_SOURCE_NODE};

/// Server used when neither `--server` nor `COMFYUI_SERVER` is set.
pub const DEFAULT_SERVER: &str = "http://127.0.0.1:8188";

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Swap the face in an image using a ComfyUI server.
#[derive(Debug, Parser)]
#[command(name = "faceswap", version, about)]
pub struct CliArgs {
    /// Path to the input image (face will be replaced)
    pub input_image: PathBuf,

    /// Path to the source image (face to use for replacement)
    pub source_image: PathBuf,

    /// Path to save the result image
    pub output_image: PathBuf,

    /// ComfyUI server address, e.g. `host:8188` (TLS) or `http://host:8188`
    #[arg(long)]
    pub server: Option<String>,

    /// Bearer token for authentication
    #[arg(short = 't', long)]
    pub token: Option<String>,

    /// Workflow JSON to use instead of the built-in face swap workflow
    #[arg(long)]
    pub workflow: Option<PathBuf>,

    /// Node id of the loader that receives the input image
    #[arg(long, default_value = DEFAULT_INPUT_NODE)]
    pub input_node: String,

    /// Node id of the loader that receives the source image
    #[arg(long, default_value = DEFAULT_SOURCE_NODE)]
    pub source_node: String,

    /// Give up when no WebSocket frame arrives for this many seconds (0 disables)
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Timeout for each HTTP request in seconds
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,

    /// Do not download outputs from the prompt history when no image was streamed
    #[arg(long)]
    pub no_history_fallback: bool,
}

/// Fully resolved settings for one face swap run.
#[derive(Debug, Clone)]
pub struct FaceSwapConfig {
    pub input_image: PathBuf,
    pub source_image: PathBuf,
    pub output_image: PathBuf,
    pub server: String,
    pub token: Option<String>,
    pub workflow: Option<PathBuf>,
    pub input_node: String,
    pub source_node: String,
    /// `None` waits for the terminal event indefinitely.
    pub idle_timeout: Option<Duration>,
    pub request_timeout: Duration,
    pub history_fallback: bool,
}

impl FaceSwapConfig {
    /// Resolve CLI arguments against the process environment.
    pub fn from_args(args: CliArgs) -> Self {
        Self::resolve(args, |name| std::env::var(name).ok())
    }

    /// Resolve CLI arguments, looking up fallbacks through `env`.
    ///
    /// Command-line values win over environment values, which win over
    /// built-in defaults.
    pub fn resolve(args: CliArgs, env: impl Fn(&str) -> Option<String>) -> Self {
        let server = args
            .server
            .or_else(|| env("COMFYUI_SERVER"))
            .unwrap_or_else(|| DEFAULT_SERVER.to_string());

        let token = args
            .token
            .or_else(|| env("COMFYUI_TOKEN"))
            .or_else(|| env("WEB_TOKEN"))
            .filter(|token| !token.trim().is_empty());

        let idle_timeout_secs = args
            .idle_timeout_secs
            .or_else(|| parse_secs(&env, "COMFYUI_IDLE_TIMEOUT_SECS"))
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);

        let request_timeout_secs = args
            .request_timeout_secs
            .or_else(|| parse_secs(&env, "COMFYUI_REQUEST_TIMEOUT_SECS"))
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        Self {
            input_image: args.input_image,
            source_image: args.source_image,
            output_image: args.output_image,
            server,
            token,
            workflow: args.workflow,
            input_node: args.input_node,
            source_node: args.source_node,
            idle_timeout: (idle_timeout_secs > 0).then(|| Duration::from_secs(idle_timeout_secs)),
            request_timeout: Duration::from_secs(request_timeout_secs),
            history_fallback: !args.no_history_fallback,
        }
    }
}

fn parse_secs(env: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    let raw = env(name)?;
    match raw.trim().parse() {
        Ok(secs) => Some(secs),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring non-numeric timeout");
            None
        }
    }
}
