//! Execution trace sidecars for the relift trace recompiler.
//!
//! The capture front end records a side-channel trace alongside the lifted
//! module: observed successor edges, function entries/callers/returns, and
//! a handful of line-oriented text sidecars. This crate owns the models and
//! parsers; the recovery passes in `relift-recover` consume them.

mod info;
mod sidecar;

pub use info::*;
pub use sidecar::*;

use thiserror::Error;

/// Trace sidecar errors.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("trace info: {0}")]
    Json(#[from] serde_json::Error),
    #[error(
        "trace info merge: {what} for {key:#x} disagrees between runs ({ours:#x} vs {theirs:#x})"
    )]
    MergeConflict {
        what: &'static str,
        key: u64,
        ours: u64,
        theirs: u64,
    },
    #[error("{file}:{line_no}: malformed sidecar line {line:?}")]
    SidecarLine {
        file: &'static str,
        line_no: usize,
        line: String,
    },
}

pub type Result<T> = std::result::Result<T, TraceError>;
