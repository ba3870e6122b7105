//! ComfyUI WebSocket and REST client library.
//!
//! Provides the per-job client session, HTTP API wrappers, asset
//! upload, typed WebSocket message parsing, the execution monitor that
//! follows a submitted job to completion, and result collection from
//! the prompt history.

pub mod api;
pub mod client;
pub mod history;
pub mod messages;
pub mod monitor;
pub mod session;
pub mod upload;
