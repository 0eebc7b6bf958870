//! Per-disk export strategy and the batched VM delta export.
//!
//! For each disk the exporter picks one of three paths: a raw NBD read,
//! an NBD-built VHD container driven by a changed-block map, or the bulk
//! HTTP export resource. Transport failures degrade along that order and
//! never abort the run on their own; only construction failures do, and
//! those carry platform context out with them.

use crate::chain::{BaseLink, ExportPlan};
use crate::error::{ExportError, PlatformContext, Result};
use crate::platform::gateway::{RawExportRequest, RpcGateway};
use crate::platform::types::{TaskRef, VdiFormat, VdiRecord, VdiRef, VdiUuid, VmRecord};
use crate::settings::BackupSettings;
use crate::stream::{fork_stream, ByteStream};
use crate::transport::nbd::{raw_stream, MultiNbdClient, NbdDialer};
use crate::transport::vhd::{vhd_stream, DiskIdentity, ProgressFn};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// One disk's export stream plus its side metadata.
pub struct DiskStream {
    pub stream: ByteStream,
    pub format: VdiFormat,
    /// Whether the NBD block path produced this stream.
    pub uses_nbd: bool,
    /// Content length when known up front (raw reads only).
    pub content_length: Option<u64>,
}

/// Identity and chain linkage of one exported disk.
#[derive(Debug, Clone)]
pub struct ExportedDisk {
    pub vdi: VdiRecord,
    pub base: Option<BaseLink>,
}

/// Ephemeral result of one backup attempt: per-disk streams and linkage.
/// Created per run, consumed once, never persisted.
pub struct DeltaExport {
    pub streams: HashMap<VdiUuid, DiskStream>,
    pub disks: HashMap<VdiUuid, ExportedDisk>,
}

impl DeltaExport {
    /// Whether any disk stream came over the NBD path.
    pub fn uses_nbd(&self) -> bool {
        self.streams.values().any(|disk| disk.uses_nbd)
    }

    /// Duplicate every disk stream so each consumer reads an independent,
    /// backpressured copy.
    pub fn fork(self, consumers: usize) -> Vec<DeltaExport> {
        let DeltaExport { streams, disks } = self;
        let mut per_consumer: Vec<HashMap<VdiUuid, DiskStream>> =
            (0..consumers).map(|_| HashMap::new()).collect();
        for (uuid, disk) in streams {
            let DiskStream {
                stream,
                format,
                uses_nbd,
                content_length,
            } = disk;
            for (slot, fork) in per_consumer.iter_mut().zip(fork_stream(stream, consumers)) {
                slot.insert(
                    uuid.clone(),
                    DiskStream {
                        stream: fork,
                        format,
                        uses_nbd,
                        content_length,
                    },
                );
            }
        }
        per_consumer
            .into_iter()
            .map(|streams| DeltaExport {
                streams,
                disks: disks.clone(),
            })
            .collect()
    }
}

/// Per-disk export decision layer.
pub struct DiskExporter {
    gateway: Arc<dyn RpcGateway>,
    dialer: Arc<dyn NbdDialer>,
    settings: BackupSettings,
}

impl DiskExporter {
    pub fn new(
        gateway: Arc<dyn RpcGateway>,
        dialer: Arc<dyn NbdDialer>,
        settings: BackupSettings,
    ) -> Self {
        Self {
            gateway,
            dialer,
            settings,
        }
    }

    /// Export one disk's content as a single stream.
    ///
    /// Construction failures are enriched with the pool master, SR and
    /// disk records before propagation.
    pub async fn export_content(
        &self,
        vdi: &VdiRef,
        base: Option<&BaseLink>,
        format: VdiFormat,
    ) -> Result<DiskStream> {
        match self.build(vdi, base, format).await {
            Ok(stream) => Ok(stream),
            Err(source) => Err(self.enrich(vdi, source).await),
        }
    }

    /// Export every disk of a VM according to the plan, concurrently.
    pub async fn export_vm_disks(&self, vm: &VmRecord, plan: &ExportPlan) -> Result<DeltaExport> {
        let disk_refs = self.gateway.vm_disks(&vm.reference).await?;
        let exports = join_all(disk_refs.iter().map(|disk| self.export_one(disk, plan))).await;

        let mut streams = HashMap::new();
        let mut disks = HashMap::new();
        for export in exports {
            let (record, base, stream) = export?;
            streams.insert(record.uuid.clone(), stream);
            disks.insert(record.uuid.clone(), ExportedDisk { vdi: record, base });
        }
        Ok(DeltaExport { streams, disks })
    }

    async fn export_one(
        &self,
        disk: &VdiRef,
        plan: &ExportPlan,
    ) -> Result<(VdiRecord, Option<BaseLink>, DiskStream)> {
        let record = self.gateway.vdi_record(disk).await?;
        // the plan keys confirmed bases by the live disk this snapshot
        // was taken from; a disk forced full simply has no entry
        let base = record
            .snapshot_of
            .as_ref()
            .and_then(|live| plan.bases.get(live))
            .cloned();
        let stream = self
            .export_content(disk, base.as_ref(), VdiFormat::Vhd)
            .await?;
        Ok((record, base, stream))
    }

    async fn build(
        &self,
        vdi: &VdiRef,
        base: Option<&BaseLink>,
        format: VdiFormat,
    ) -> Result<DiskStream> {
        if base.is_some() && format != VdiFormat::Vhd {
            return Err(ExportError::platform(
                "delta export is only compatible with the vhd format",
            ));
        }

        let record = self.gateway.vdi_record(vdi).await?;
        let parent_uuid = match base {
            Some(link) => {
                let base_record = self.gateway.vdi_record(&link.base_ref).await?;
                Some(
                    base_record
                        .vhd_parent()
                        .map(VdiUuid::new)
                        .unwrap_or_else(|| link.base_uuid.clone()),
                )
            }
            None => None,
        };

        let mut changed = None;
        let mut client = None;
        if self.settings.prefer_nbd {
            // changed blocks must be listed before the disk is opened for
            // NBD export; failure degrades to a full block read
            if record.cbt_enabled {
                if let Some(link) = base {
                    match self.gateway.list_changed_blocks(&link.base_ref, vdi).await {
                        Ok(map) => {
                            info!(vdi = %record.uuid, changed = map.changed_count(), "found changed blocks");
                            changed = Some(map);
                        }
                        Err(err) => {
                            let err = ExportError::ChangedBlockUnavailable(err.to_string());
                            info!(vdi = %record.uuid, %err, "using full block read");
                        }
                    }
                }
            }

            match self.gateway.nbd_info(vdi).await {
                Ok(endpoints) if !endpoints.is_empty() => {
                    match MultiNbdClient::connect(
                        self.dialer.as_ref(),
                        &endpoints,
                        self.settings.nbd_concurrency,
                    )
                    .await
                    {
                        Ok(connected) => client = Some(Arc::new(connected)),
                        Err(err) => {
                            warn!(vdi = %record.uuid, %err, "cannot connect to nbd server, using bulk export");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(vdi = %record.uuid, %err, "nbd endpoint discovery failed, using bulk export");
                }
            }
        }

        let assembled = self
            .assemble(&record, base, parent_uuid, format, changed, client.clone())
            .await;
        if assembled.is_err() {
            if let Some(client) = &client {
                client.disconnect().await;
            }
        }
        assembled
    }

    async fn assemble(
        &self,
        record: &VdiRecord,
        base: Option<&BaseLink>,
        parent_uuid: Option<VdiUuid>,
        format: VdiFormat,
        changed: Option<crate::platform::types::ChangedBlocks>,
        client: Option<Arc<MultiNbdClient>>,
    ) -> Result<DiskStream> {
        match (client, format) {
            // raw never uses the changed-block path
            (Some(client), VdiFormat::Raw) => Ok(DiskStream {
                stream: raw_stream(client),
                format: VdiFormat::Raw,
                uses_nbd: true,
                content_length: Some(record.virtual_size),
            }),
            (Some(client), VdiFormat::Vhd) => {
                let task = self
                    .gateway
                    .create_task(&format!(
                        "Exporting content of VDI {} using NBD{}",
                        record.name_label,
                        if changed.is_some() { " and CBT" } else { "" }
                    ))
                    .await?;
                let identity = DiskIdentity {
                    virtual_size: record.virtual_size,
                    uuid: record.uuid.clone(),
                    base_uuid: parent_uuid,
                };
                let stream = vhd_stream(client, identity, changed, Some(self.task_progress(task)));
                Ok(DiskStream {
                    stream,
                    format: VdiFormat::Vhd,
                    uses_nbd: true,
                    content_length: None,
                })
            }
            (None, format) => {
                let task = self
                    .gateway
                    .create_task(&format!("Exporting content of VDI {}", record.name_label))
                    .await?;
                let stream = self
                    .gateway
                    .export_raw_vdi(RawExportRequest {
                        format,
                        vdi: record.reference.clone(),
                        base: base.map(|link| link.base_ref.clone()),
                        task,
                    })
                    .await?;
                Ok(DiskStream {
                    stream,
                    format,
                    uses_nbd: false,
                    content_length: None,
                })
            }
        }
    }

    fn task_progress(&self, task: TaskRef) -> ProgressFn {
        let gateway = self.gateway.clone();
        Box::new(move |ratio| {
            let gateway = gateway.clone();
            let task = task.clone();
            tokio::spawn(async move {
                let _ = gateway.set_task_progress(&task, ratio).await;
            });
        })
    }

    async fn enrich(&self, vdi: &VdiRef, source: ExportError) -> ExportError {
        let mut context = PlatformContext::default();
        if let Ok(master) = self.gateway.pool_master().await {
            context.pool_master = self.gateway.host_record(&master).await.ok();
        }
        if let Ok(record) = self.gateway.vdi_record(vdi).await {
            context.sr = self.gateway.sr_record(&record.sr).await.ok();
            context.vdi = Some(record);
        }
        ExportError::ExportConstruction {
            context: Box::new(context),
            source: Box::new(source),
        }
    }
}
