//! Network-free building blocks of the face swap client.
//!
//! Holds the shared error taxonomy, the job graph template builder, the
//! result set collected while a job runs, and the assembler that turns
//! result payloads into image files.

pub mod error;
pub mod naming;
pub mod results;
pub mod workflow;
