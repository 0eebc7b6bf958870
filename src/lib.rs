//! Incremental VM backup export.
//!
//! Exports a VM's disks from a hypervisor pool to one or more backup
//! writers, as deltas against a confirmed base snapshot when the chain
//! allows it and as full copies otherwise. Disk content moves over NBD
//! when available, narrowed by changed-block tracking, with the bulk
//! HTTP export resource as fallback.
//!
//! Entry point is [`orchestrator::ExportOrchestrator`]; destinations
//! implement [`writer::WriterSink`]; platform access goes through
//! [`platform::RpcGateway`].

pub mod chain;
pub mod error;
pub mod export;
pub mod orchestrator;
pub mod platform;
pub mod settings;
pub mod stream;
pub mod transport;
pub mod vhd;
pub mod writer;

pub use error::{ExportError, Result};
pub use orchestrator::{ExportOrchestrator, RunSummary};
pub use settings::BackupSettings;
pub use writer::WriterSink;
