//! One incremental export run, end to end.
//!
//! The orchestrator owns phase ordering: base selection, writer prepare,
//! disk export, the stream transform pipeline, fan-out transfer, chain
//! update and platform metadata. Writer failures degrade the run; only
//! losing every writer, or failing to construct the export itself, aborts
//! it. Cleanup runs on every exit path.

use crate::chain::ChainSelector;
use crate::error::{ExportError, Result};
use crate::export::DiskExporter;
use crate::platform::gateway::RpcGateway;
use crate::platform::types::{keys, VdiFormat, VmRecord};
use crate::settings::BackupSettings;
use crate::stream::{detect_differencing, validate_vhd, watch_size, SizeWatcher, Throttle};
use crate::transport::nbd::NbdDialer;
use crate::writer::{ChainUpdatePayload, TransferPayload, WriterSet, WriterSink};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Outcome of a completed run. Writer failures that degraded but did not
/// abort the run are reported here.
#[derive(Debug)]
pub struct RunSummary {
    pub is_full: bool,
    pub transferred_bytes: u64,
    pub duration: std::time::Duration,
    pub writer_errors: Vec<ExportError>,
}

pub struct ExportOrchestrator {
    gateway: Arc<dyn RpcGateway>,
    dialer: Arc<dyn NbdDialer>,
    settings: BackupSettings,
}

impl ExportOrchestrator {
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

    /// Run one export of `snapshot` (the frozen disk set) against the
    /// chain metadata carried by `vm`.
    pub async fn run(
        &self,
        vm: &VmRecord,
        snapshot: &VmRecord,
        job_id: &str,
        writers: Vec<Arc<dyn WriterSink>>,
    ) -> Result<RunSummary> {
        if writers.is_empty() {
            return Err(ExportError::Config(
                "an export run needs at least one writer".into(),
            ));
        }
        let mut writer_set = WriterSet::new(writers);
        let outcome = self
            .run_inner(vm, snapshot, job_id, &mut writer_set)
            .await;
        let cleanup_errors = writer_set.cleanup_all().await;
        match outcome {
            Ok(mut summary) => {
                summary.writer_errors.extend(cleanup_errors);
                Ok(summary)
            }
            Err(err) => Err(err),
        }
    }

    async fn run_inner(
        &self,
        vm: &VmRecord,
        snapshot: &VmRecord,
        job_id: &str,
        writer_set: &mut WriterSet,
    ) -> Result<RunSummary> {
        let plan = ChainSelector::new(self.gateway.as_ref())
            .select(vm, job_id, self.settings.full_interval, writer_set)
            .await?;
        let is_full = plan.is_full();

        let mut writer_errors = writer_set
            .fan_out("prepare", true, move |writer| {
                Box::pin(async move { writer.prepare(is_full).await })
            })
            .await;
        if !writer_set.any_active() {
            return Err(ExportError::RunFatal("every writer failed prepare".into()));
        }

        let exporter = DiskExporter::new(
            self.gateway.clone(),
            self.dialer.clone(),
            self.settings.clone(),
        );
        let mut delta = exporter.export_vm_disks(snapshot, &plan).await?;
        if delta.uses_nbd() {
            info!(vm = %snapshot.uuid, "transfer data using NBD");
        }

        // differencing detection reads the stream head, so it must run
        // before any other transform touches the bytes
        let mut differencing = HashMap::new();
        let detections = std::mem::take(&mut delta.streams)
            .into_iter()
            .map(|(uuid, mut disk)| async move {
                let (is_differencing, replayed) = detect_differencing(disk.stream).await?;
                disk.stream = replayed;
                Ok::<_, io::Error>((uuid, is_differencing, disk))
            });
        for detection in join_all(detections).await {
            let (uuid, is_differencing, disk) = detection?;
            differencing.insert(uuid.clone(), is_differencing);
            delta.streams.insert(uuid, disk);
        }

        let mut sizes: HashMap<_, SizeWatcher> = HashMap::new();
        let throttle = Throttle::new(self.settings.throttle_bytes_per_sec);
        for (uuid, mut disk) in std::mem::take(&mut delta.streams) {
            let (watcher, mut stream) = watch_size(disk.stream);
            sizes.insert(uuid.clone(), watcher);
            if self.settings.validate_vhd_streams && disk.format == VdiFormat::Vhd {
                stream = validate_vhd(uuid.as_str(), stream);
            }
            disk.stream = throttle.wrap(stream);
            delta.streams.insert(uuid, disk);
        }

        let timestamp = Utc::now();
        let started = Instant::now();
        let exported_disks = delta.disks.clone();

        let active = writer_set.active_writers();
        let forks = delta.fork(active.len());
        let transfers = active
            .into_iter()
            .zip(forks)
            .map(|((index, writer), delta)| {
                let payload = TransferPayload {
                    delta,
                    differencing: differencing.clone(),
                    sizes: sizes.clone(),
                    timestamp,
                    vm: vm.clone(),
                    snapshot: snapshot.clone(),
                };
                async move { (index, writer.transfer(payload).await) }
            });
        for (index, result) in join_all(transfers).await {
            if let Err(source) = result {
                writer_errors.push(writer_set.evict(index, "transfer", source));
            }
        }
        if !writer_set.any_active() {
            // nothing landed anywhere, so the platform must keep looking
            // like this run never happened
            return Err(ExportError::RunFatal(
                "every writer failed to transfer, no usable copy exists".into(),
            ));
        }

        let chain_update = ChainUpdatePayload {
            differencing,
            timestamp,
            disks: exported_disks,
        };
        writer_errors.extend(
            writer_set
                .fan_out("update_uuid_and_chain", true, move |writer| {
                    let payload = chain_update.clone();
                    Box::pin(async move { writer.update_uuid_and_chain(payload).await })
                })
                .await,
        );

        let chain_length = if plan.base_vm.is_some() {
            let previous: u64 = vm
                .other_config
                .get(keys::CHAIN_LENGTH)
                .and_then(|value| value.parse().ok())
                .unwrap_or(0);
            previous + 1
        } else {
            // full run, the chain restarts here
            1
        };
        self.gateway
            .update_vm_other_config(
                &snapshot.reference,
                keys::CHAIN_LENGTH,
                Some(&chain_length.to_string()),
            )
            .await?;
        if snapshot.is_a_snapshot {
            self.gateway
                .update_vm_other_config(&snapshot.reference, keys::EXPORTED, Some("true"))
                .await?;
        }

        let transferred_bytes: u64 = sizes.values().map(|watcher| watcher.bytes()).sum();
        let duration = started.elapsed();
        let seconds = duration.as_secs_f64();
        debug!(
            vm = %snapshot.uuid,
            duration_ms = duration.as_millis() as u64,
            size = transferred_bytes,
            speed_mib_s = if seconds > 0.0 {
                transferred_bytes as f64 / (1024.0 * 1024.0) / seconds
            } else {
                0.0
            },
            "transfer done"
        );

        Ok(RunSummary {
            is_full,
            transferred_bytes,
            duration,
            writer_errors,
        })
    }
}
