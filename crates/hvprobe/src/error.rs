//! Errors at the outer edge: configuration and name lookup.
//!
//! Probe outcomes are never errors; they show up (or don't) in the
//! returned records.

use alloc::string::String;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("fault vector {0:#x} is not an architectural exception")]
    VectorOutOfRange(u8),

    #[error("unknown operation `{0}` (expected nop, alu, cpuid, smi or xsetbv)")]
    UnknownOperation(String),

    #[error("unknown machine profile `{0}`")]
    UnknownProfile(String),

    #[error("unknown battery scope `{0}` (expected basic or advanced)")]
    UnknownScope(String),

    #[error("unknown metric `{0}`")]
    UnknownMetric(String),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "std")]
    #[error("cannot read {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[cfg(feature = "std")]
    #[error("cannot start timekeeper thread: {0}")]
    Thread(#[source] std::io::Error),
}

pub type Result<T> = core::result::Result<T, ProbeError>;
