//! Face swap command-line front end.
//!
//! Resolves configuration, drives the upload, execution and assembly
//! steps against a ComfyUI server, and maps failures onto a single
//! error type for the binary.

pub mod config;
pub mod error;
pub mod pipeline;
