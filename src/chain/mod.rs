//! Base selection for incremental chains.
//!
//! Inspects each disk's snapshot history for a prior backup point of the
//! same job, asks every writer whether it still holds that base intact,
//! and produces the immutable plan the orchestrator runs against. A chain
//! link is trusted only when every writer confirms it; anything less
//! forces that disk to a full export so the chain never forks silently.

use crate::error::Result;
use crate::platform::gateway::RpcGateway;
use crate::platform::types::{keys, VdiRecord, VdiRef, VdiUuid, VmRecord, VmRef};
use crate::writer::{BaseVdiMap, WriterSet};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Confirmed base snapshot for one live disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseLink {
    pub base_ref: VdiRef,
    pub base_uuid: VdiUuid,
}

/// Immutable result of base selection, consumed by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ExportPlan {
    /// The VM whose chain metadata this run inherits, when a base was used.
    pub base_vm: Option<VmRef>,
    /// Live-disk UUIDs that must go full. `None` means base selection did
    /// not run (interval forced, or nothing confirmable): everything full.
    pub full_vdis_required: Option<HashSet<VdiUuid>>,
    /// Confirmed base per live source disk.
    pub bases: HashMap<VdiRef, BaseLink>,
}

impl ExportPlan {
    /// A plan with no usable base: every disk exports full.
    pub fn full() -> Self {
        Self::default()
    }

    /// Whether the run as a whole counts as full.
    pub fn is_full(&self) -> bool {
        match &self.full_vdis_required {
            None => true,
            Some(required) => !required.is_empty(),
        }
    }
}

/// Among a disk's snapshots, the most recent one belonging to `job_id`.
/// Ties and ordering follow the stored RFC 3339 timestamp, compared
/// lexicographically; the last in sorted order wins.
fn pick_latest(mut snapshots: Vec<VdiRecord>, job_id: &str) -> Option<VdiRecord> {
    snapshots.retain(|snap| snap.other_config.get(keys::JOB).map(String::as_str) == Some(job_id));
    snapshots.sort_by(|a, b| {
        a.other_config
            .get(keys::DATETIME)
            .cmp(&b.other_config.get(keys::DATETIME))
    });
    snapshots.pop()
}

pub struct ChainSelector<'a> {
    gateway: &'a dyn RpcGateway,
}

impl<'a> ChainSelector<'a> {
    pub fn new(gateway: &'a dyn RpcGateway) -> Self {
        Self { gateway }
    }

    /// Build the export plan for one run.
    pub async fn select(
        &self,
        vm: &VmRecord,
        job_id: &str,
        full_interval: u32,
        writers: &mut WriterSet,
    ) -> Result<ExportPlan> {
        let chain_length: u32 = vm
            .other_config
            .get(keys::CHAIN_LENGTH)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if full_interval != 0 && chain_length >= full_interval {
            debug!(chain_length, full_interval, "full interval reached, not using a base VM");
            return Ok(ExportPlan::full());
        }

        let disk_refs = self.gateway.vm_disks(&vm.reference).await?;
        let candidates = join_all(
            disk_refs
                .iter()
                .map(|disk| self.candidate_for_disk(disk, job_id)),
        )
        .await;

        let mut base_uuid_to_src: BaseVdiMap = HashMap::new();
        let mut bases: HashMap<VdiRef, BaseLink> = HashMap::new();
        for candidate in candidates {
            if let Some((src, link)) = candidate? {
                base_uuid_to_src.insert(link.base_uuid.clone(), src.clone());
                bases.insert(src.reference.clone(), link);
            }
        }

        if base_uuid_to_src.is_empty() {
            debug!("no base VM found");
            return Ok(ExportPlan::full());
        }

        let retained = self.confirm_with_writers(&base_uuid_to_src, writers).await;
        if retained.is_empty() {
            debug!("no writer confirmed any base, falling back to full");
            return Ok(ExportPlan::full());
        }

        let mut full_vdis_required = HashSet::new();
        for (base_uuid, src) in &base_uuid_to_src {
            if retained.contains(base_uuid) {
                debug!(base = %base_uuid, vdi = %src.uuid, "found base VDI");
            } else {
                debug!(base = %base_uuid, vdi = %src.uuid, "missing base VDI");
                full_vdis_required.insert(src.uuid.clone());
            }
        }
        bases.retain(|_, link| retained.contains(&link.base_uuid));

        Ok(ExportPlan {
            base_vm: Some(vm.reference.clone()),
            full_vdis_required: Some(full_vdis_required),
            bases,
        })
    }

    /// The latest same-job snapshot of one disk, if any.
    async fn candidate_for_disk(
        &self,
        disk: &VdiRef,
        job_id: &str,
    ) -> Result<Option<(VdiRecord, BaseLink)>> {
        let snapshot_refs = self.gateway.vdi_snapshots(disk).await?;
        let records = join_all(
            snapshot_refs
                .iter()
                .map(|snap| self.gateway.vdi_record(snap)),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

        match pick_latest(records, job_id) {
            Some(snapshot) => {
                let src = self.gateway.vdi_record(disk).await?;
                let link = BaseLink {
                    base_ref: snapshot.reference,
                    base_uuid: snapshot.uuid,
                };
                Ok(Some((src, link)))
            }
            None => {
                debug!(vdi = %disk, "no snapshot of this job found for disk");
                Ok(None)
            }
        }
    }

    /// Batched base confirmation: every writer checks the whole candidate
    /// map concurrently; the retained set is the intersection of what all
    /// writers still hold. A writer error means it trusts no bases.
    async fn confirm_with_writers(
        &self,
        candidates: &BaseVdiMap,
        writers: &mut WriterSet,
    ) -> HashSet<VdiUuid> {
        let checks: Vec<_> = writers
            .active_writers()
            .into_iter()
            .map(|(_, writer)| {
                let mut map = candidates.clone();
                async move {
                    let name = writer.name().to_string();
                    let result = writer.check_base_vdis(&mut map).await;
                    (name, result.map(|_| map))
                }
            })
            .collect();

        let mut retained: HashSet<VdiUuid> = candidates.keys().cloned().collect();
        for (name, result) in join_all(checks).await {
            match result {
                Ok(survivors) => {
                    retained.retain(|uuid| survivors.contains_key(uuid));
                }
                Err(err) => {
                    warn!(writer = %name, %err, "base check failed, writer trusts no bases");
                    retained.clear();
                }
            }
        }
        retained
    }
}
