//! Destination writer contract and per-run writer management.
//!
//! Writers persist exported disk content and chain linkage. Lifecycle
//! phases run strictly in order, each phase fanned out to all writers
//! concurrently. A writer failing `prepare`, `transfer` or
//! `update_uuid_and_chain` is excluded from later phases of the run but
//! never prevents its siblings from proceeding; `cleanup` is always
//! invoked, for evicted writers too.

use crate::error::ExportError;
use crate::export::{DeltaExport, ExportedDisk};
use crate::platform::types::{VdiRecord, VdiUuid, VmRecord};
use crate::stream::SizeWatcher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Candidate bases handed to `check_base_vdis`: base snapshot UUID to the
/// live source disk it backs.
pub type BaseVdiMap = HashMap<VdiUuid, VdiRecord>;

/// Payload of the `transfer` phase. Each writer receives its own fork of
/// every disk stream.
pub struct TransferPayload {
    pub delta: DeltaExport,
    /// Per disk: whether the stream encodes a differencing container.
    pub differencing: HashMap<VdiUuid, bool>,
    /// Per disk: running byte count of the shared (pre-fork) stream.
    pub sizes: HashMap<VdiUuid, SizeWatcher>,
    pub timestamp: DateTime<Utc>,
    pub vm: VmRecord,
    pub snapshot: VmRecord,
}

/// Payload of the `update_uuid_and_chain` phase: the point where each
/// disk's identity at the destination is fixed and linked to its base.
#[derive(Clone)]
pub struct ChainUpdatePayload {
    pub differencing: HashMap<VdiUuid, bool>,
    pub timestamp: DateTime<Utc>,
    pub disks: HashMap<VdiUuid, ExportedDisk>,
}

/// Lifecycle contract every destination writer implements.
///
/// Phases are called once per run, in order:
/// `prepare` → `check_base_vdis`? → `transfer` → `update_uuid_and_chain`
/// → `cleanup`. `check_base_vdis` is only called when a non-empty
/// candidate base map exists. Writers must tolerate an empty disk set and
/// keep `cleanup` idempotent and safe after skipped or failed phases.
#[async_trait]
pub trait WriterSink: Send + Sync {
    fn name(&self) -> &str;

    async fn prepare(&self, is_full: bool) -> anyhow::Result<()>;

    /// Remove every candidate base this writer no longer holds intact.
    /// The default keeps all candidates; writers without base storage
    /// need not override it. An error means none of this writer's bases
    /// can be trusted.
    async fn check_base_vdis(&self, candidates: &mut BaseVdiMap) -> anyhow::Result<()> {
        let _ = candidates;
        Ok(())
    }

    async fn transfer(&self, payload: TransferPayload) -> anyhow::Result<()>;

    async fn update_uuid_and_chain(&self, payload: ChainUpdatePayload) -> anyhow::Result<()>;

    async fn cleanup(&self) -> anyhow::Result<()>;
}

/// The writers of one run, with per-run phase eligibility.
pub struct WriterSet {
    writers: Vec<Arc<dyn WriterSink>>,
    active: Vec<bool>,
}

impl WriterSet {
    pub fn new(writers: Vec<Arc<dyn WriterSink>>) -> Self {
        let active = vec![true; writers.len()];
        Self { writers, active }
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    pub fn any_active(&self) -> bool {
        self.active.iter().any(|a| *a)
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|a| **a).count()
    }

    /// Writers still eligible for the current phase, with their indices.
    pub fn active_writers(&self) -> Vec<(usize, Arc<dyn WriterSink>)> {
        self.writers
            .iter()
            .enumerate()
            .filter(|(i, _)| self.active[*i])
            .map(|(i, w)| (i, w.clone()))
            .collect()
    }

    /// Record a phase failure: log it, mark the writer ineligible for
    /// later phases, and return the wrapped error.
    pub fn evict(
        &mut self,
        index: usize,
        phase: &'static str,
        source: anyhow::Error,
    ) -> ExportError {
        let writer = self.writers[index].name().to_string();
        warn!(writer = %writer, phase, error = %source, "writer failed, excluded from later phases");
        self.active[index] = false;
        ExportError::WriterPhase {
            writer,
            phase,
            source,
        }
    }

    /// Run one phase concurrently on every active writer. Errors are
    /// collected, never short-circuited; with `evict_on_error` the
    /// failing writers drop out of later phases.
    pub async fn fan_out<F>(
        &mut self,
        phase: &'static str,
        evict_on_error: bool,
        make: F,
    ) -> Vec<ExportError>
    where
        F: Fn(Arc<dyn WriterSink>) -> BoxFuture<'static, anyhow::Result<()>>,
    {
        let calls: Vec<_> = self
            .active_writers()
            .into_iter()
            .map(|(index, writer)| {
                let fut = make(writer);
                async move { (index, fut.await) }
            })
            .collect();

        let mut errors = Vec::new();
        for (index, result) in join_all(calls).await {
            if let Err(source) = result {
                if evict_on_error {
                    errors.push(self.evict(index, phase, source));
                } else {
                    let writer = self.writers[index].name().to_string();
                    warn!(writer = %writer, phase, error = %source, "writer phase failed");
                    errors.push(ExportError::WriterPhase {
                        writer,
                        phase,
                        source,
                    });
                }
            }
        }
        errors
    }

    /// Best-effort `cleanup` on every writer, evicted ones included.
    pub async fn cleanup_all(&self) -> Vec<ExportError> {
        let calls: Vec<_> = self
            .writers
            .iter()
            .map(|writer| {
                let writer = writer.clone();
                async move {
                    let name = writer.name().to_string();
                    (name, writer.cleanup().await)
                }
            })
            .collect();

        let mut errors = Vec::new();
        for (name, result) in join_all(calls).await {
            if let Err(source) = result {
                warn!(writer = %name, error = %source, "writer cleanup failed");
                errors.push(ExportError::WriterPhase {
                    writer: name,
                    phase: "cleanup",
                    source,
                });
            }
        }
        errors
    }
}
