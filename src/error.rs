//! Error types for backup export runs.
//!
//! The taxonomy distinguishes errors that trigger a fallback path
//! (transport connect, changed-block listing) from errors that are fatal
//! for a single disk, a single writer, or the whole run.

use crate::platform::types::{HostRecord, SrRecord, VdiRecord};
use std::fmt;

/// Platform records attached to an export construction failure so the
/// affected pool/SR/disk can be identified without re-querying.
#[derive(Debug, Default, Clone)]
pub struct PlatformContext {
    pub pool_master: Option<HostRecord>,
    pub sr: Option<SrRecord>,
    pub vdi: Option<VdiRecord>,
}

impl fmt::Display for PlatformContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = |s: &Option<String>| s.clone().unwrap_or_else(|| "?".into());
        write!(
            f,
            "pool master {}, SR {}, VDI {}",
            name(&self.pool_master.as_ref().map(|h| h.name_label.clone())),
            name(&self.sr.as_ref().map(|s| s.name_label.clone())),
            name(&self.vdi.as_ref().map(|v| v.uuid.to_string())),
        )
    }
}

/// The main error type for backup export operations.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Could not connect to any NBD endpoint. Non-fatal: the caller falls
    /// back to the bulk HTTP export path.
    #[error("NBD transport connect failed: {0}")]
    TransportConnect(String),

    /// Changed-block listing is not available for this disk pair.
    /// Non-fatal: the caller degrades to a full block read.
    #[error("changed-block listing unavailable: {0}")]
    ChangedBlockUnavailable(String),

    /// A disk stream failed structural validation. Fatal for that disk.
    #[error("stream validation failed for disk {disk}: {message}")]
    StreamValidation { disk: String, message: String },

    /// A writer failed one of its lifecycle phases. The writer is excluded
    /// from later phases of the run; siblings continue.
    #[error("writer '{writer}' failed during {phase}: {source}")]
    WriterPhase {
        writer: String,
        phase: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Building a disk export stream failed irrecoverably, with platform
    /// context attached for diagnosis.
    #[error("disk export construction failed ({context}): {source}")]
    ExportConstruction {
        context: Box<PlatformContext>,
        #[source]
        source: Box<ExportError>,
    },

    /// The whole run failed; no platform metadata was mutated.
    #[error("backup run failed: {0}")]
    RunFatal(String),

    /// A platform RPC call failed.
    #[error("platform call failed{}: {message}", code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default())]
    Platform {
        code: Option<String>,
        message: String,
    },

    /// Invalid run configuration.
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for backup export operations.
pub type Result<T> = std::result::Result<T, ExportError>;

/// Platform error code for an already-released object handle.
pub const HANDLE_INVALID: &str = "HANDLE_INVALID";

impl ExportError {
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            code: None,
            message: message.into(),
        }
    }

    pub fn platform_coded(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Platform {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// True for the transient "handle invalid" platform error, which is
    /// treated as already-satisfied by destroy-like operations.
    pub fn is_handle_invalid(&self) -> bool {
        matches!(self, Self::Platform { code: Some(c), .. } if c == HANDLE_INVALID)
    }
}
