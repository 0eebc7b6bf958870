//! In-memory pool, NBD fabric and recording writers shared by the
//! integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use vbak::error::{ExportError, Result, HANDLE_INVALID};
use vbak::platform::{
    keys, ChangedBlocks, HostRecord, HostRef, NbdEndpoint, OtherConfig, RawExportRequest,
    RawImportRequest, RpcGateway, SrRecord, SrRef, TaskRef, VdiRecord, VdiRef, VdiUuid, VmRecord,
    VmRef, VmUuid,
};
use vbak::stream::{collect, from_chunks, ByteStream};
use vbak::transport::{NbdChannel, NbdDialer};
use vbak::writer::{BaseVdiMap, ChainUpdatePayload, TransferPayload, WriterSink};

pub const JOB_ID: &str = "job-1";

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Default)]
pub struct PoolState {
    pub vms: HashMap<VmRef, VmRecord>,
    pub vdis: HashMap<VdiRef, VdiRecord>,
    pub hosts: HashMap<HostRef, HostRecord>,
    pub srs: HashMap<SrRef, SrRecord>,
    pub master: Option<HostRef>,
    pub vm_disks: HashMap<VmRef, Vec<VdiRef>>,
    pub vdi_snapshots: HashMap<VdiRef, Vec<VdiRef>>,
    /// Change map bits keyed by (base, vdi).
    pub changed: HashMap<(VdiRef, VdiRef), Bytes>,
    pub nbd: HashMap<VdiRef, Vec<NbdEndpoint>>,
    /// Content served by the bulk HTTP export endpoint.
    pub http_images: HashMap<VdiRef, Bytes>,
    pub progress: Vec<(TaskRef, f64)>,
    pub imported: Vec<(VdiRef, usize)>,
}

/// In-memory stand-in for the pool RPC surface.
#[derive(Default)]
pub struct FakeGateway {
    pub state: Mutex<PoolState>,
    pub fail_changed_blocks: AtomicBool,
    pub fail_import: AtomicBool,
    task_counter: AtomicUsize,
}

impl FakeGateway {
    pub fn vm_key(&self, vm: &VmRef, key: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.vms.get(vm)?.other_config.get(key).cloned()
    }

    pub fn vdi_key(&self, vdi: &VdiRef, key: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.vdis.get(vdi)?.other_config.get(key).cloned()
    }
}

fn unknown(what: &str) -> ExportError {
    ExportError::platform(format!("unknown reference: {what}"))
}

#[async_trait]
impl RpcGateway for FakeGateway {
    async fn vm_record(&self, vm: &VmRef) -> Result<VmRecord> {
        let state = self.state.lock().unwrap();
        state.vms.get(vm).cloned().ok_or_else(|| unknown(vm.as_str()))
    }

    async fn vdi_record(&self, vdi: &VdiRef) -> Result<VdiRecord> {
        let state = self.state.lock().unwrap();
        state.vdis.get(vdi).cloned().ok_or_else(|| unknown(vdi.as_str()))
    }

    async fn host_record(&self, host: &HostRef) -> Result<HostRecord> {
        let state = self.state.lock().unwrap();
        state
            .hosts
            .get(host)
            .cloned()
            .ok_or_else(|| unknown(host.as_str()))
    }

    async fn sr_record(&self, sr: &SrRef) -> Result<SrRecord> {
        let state = self.state.lock().unwrap();
        state.srs.get(sr).cloned().ok_or_else(|| unknown(sr.as_str()))
    }

    async fn pool_master(&self) -> Result<HostRef> {
        let state = self.state.lock().unwrap();
        state
            .master
            .clone()
            .ok_or_else(|| ExportError::platform("no pool master"))
    }

    async fn vm_disks(&self, vm: &VmRef) -> Result<Vec<VdiRef>> {
        let state = self.state.lock().unwrap();
        Ok(state.vm_disks.get(vm).cloned().unwrap_or_default())
    }

    async fn vdi_snapshots(&self, vdi: &VdiRef) -> Result<Vec<VdiRef>> {
        let state = self.state.lock().unwrap();
        Ok(state.vdi_snapshots.get(vdi).cloned().unwrap_or_default())
    }

    async fn list_changed_blocks(&self, base: &VdiRef, vdi: &VdiRef) -> Result<ChangedBlocks> {
        if self.fail_changed_blocks.load(Ordering::Relaxed) {
            return Err(ExportError::platform_coded(
                "SR_BACKEND_FAILURE_460",
                "failed to calculate changed blocks for given VDIs",
            ));
        }
        let state = self.state.lock().unwrap();
        state
            .changed
            .get(&(base.clone(), vdi.clone()))
            .cloned()
            .map(ChangedBlocks::from_bits)
            .ok_or_else(|| ExportError::platform("no changed block data"))
    }

    async fn nbd_info(&self, vdi: &VdiRef) -> Result<Vec<NbdEndpoint>> {
        let state = self.state.lock().unwrap();
        Ok(state.nbd.get(vdi).cloned().unwrap_or_default())
    }

    async fn create_task(&self, _label: &str) -> Result<TaskRef> {
        let n = self.task_counter.fetch_add(1, Ordering::Relaxed);
        Ok(TaskRef::new(format!("OpaqueRef:task{n}")))
    }

    async fn set_task_progress(&self, task: &TaskRef, progress: f64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.progress.push((task.clone(), progress));
        Ok(())
    }

    async fn export_raw_vdi(&self, request: RawExportRequest) -> Result<ByteStream> {
        let state = self.state.lock().unwrap();
        let image = state
            .http_images
            .get(&request.vdi)
            .cloned()
            .ok_or_else(|| ExportError::platform("export resource unavailable"))?;
        Ok(from_chunks(vec![image]))
    }

    async fn import_raw_vdi(&self, request: RawImportRequest, content: ByteStream) -> Result<()> {
        if self.fail_import.load(Ordering::Relaxed) {
            return Err(ExportError::platform_coded("SR_FULL", "no space left"));
        }
        let received = collect(content).await?;
        let mut state = self.state.lock().unwrap();
        state.imported.push((request.vdi, received.len()));
        Ok(())
    }

    async fn update_vm_other_config(
        &self,
        vm: &VmRef,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state.vms.get_mut(vm).ok_or_else(|| unknown(vm.as_str()))?;
        match value {
            Some(value) => record.other_config.insert(key.into(), value.into()),
            None => record.other_config.remove(key),
        };
        Ok(())
    }

    async fn update_vdi_other_config(
        &self,
        vdi: &VdiRef,
        key: &str,
        value: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state.vdis.get_mut(vdi).ok_or_else(|| unknown(vdi.as_str()))?;
        match value {
            Some(value) => record.other_config.insert(key.into(), value.into()),
            None => record.other_config.remove(key),
        };
        Ok(())
    }

    async fn destroy_vdi(&self, vdi: &VdiRef) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.vdis.remove(vdi).is_none() {
            return Err(ExportError::platform_coded(
                HANDLE_INVALID,
                "object has been released",
            ));
        }
        Ok(())
    }
}

/// In-memory NBD fabric: one byte image per export name.
#[derive(Default)]
pub struct NbdFabric {
    pub images: Mutex<HashMap<String, Bytes>>,
    pub refuse: AtomicBool,
    pub open_channels: Arc<AtomicUsize>,
}

impl NbdFabric {
    pub fn serve(&self, export_name: &str, image: Bytes) {
        self.images
            .lock()
            .unwrap()
            .insert(export_name.to_string(), image);
    }
}

struct FabricChannel {
    image: Bytes,
    open: Arc<AtomicUsize>,
}

#[async_trait]
impl NbdDialer for NbdFabric {
    async fn dial(&self, endpoint: &NbdEndpoint) -> Result<Box<dyn NbdChannel>> {
        if self.refuse.load(Ordering::Relaxed) {
            return Err(ExportError::TransportConnect("connection refused".into()));
        }
        let image = self
            .images
            .lock()
            .unwrap()
            .get(&endpoint.export_name)
            .cloned()
            .ok_or_else(|| ExportError::TransportConnect("unknown export".into()))?;
        self.open_channels.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(FabricChannel {
            image,
            open: self.open_channels.clone(),
        }))
    }
}

#[async_trait]
impl NbdChannel for FabricChannel {
    fn export_size(&self) -> u64 {
        self.image.len() as u64
    }

    async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes> {
        let start = offset as usize;
        let end = start + length as usize;
        if end > self.image.len() {
            return Err(ExportError::platform("nbd read past end of export"));
        }
        Ok(self.image.slice(start..end))
    }

    async fn close(&mut self) -> Result<()> {
        self.open.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Writer that records every phase and drains transfer streams to memory.
pub struct RecordingWriter {
    name: String,
    /// Base container UUIDs this writer claims to still hold.
    pub held_bases: Mutex<HashSet<String>>,
    pub fail_prepare: AtomicBool,
    pub fail_transfer: AtomicBool,
    pub prepared: Mutex<Vec<bool>>,
    pub contents: Mutex<HashMap<String, Bytes>>,
    pub differencing: Mutex<HashMap<String, bool>>,
    pub chain_updates: Mutex<Vec<ChainUpdatePayload>>,
    pub cleanups: AtomicUsize,
}

impl RecordingWriter {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            held_bases: Mutex::new(HashSet::new()),
            fail_prepare: AtomicBool::new(false),
            fail_transfer: AtomicBool::new(false),
            prepared: Mutex::new(Vec::new()),
            contents: Mutex::new(HashMap::new()),
            differencing: Mutex::new(HashMap::new()),
            chain_updates: Mutex::new(Vec::new()),
            cleanups: AtomicUsize::new(0),
        })
    }

    pub fn hold_base(self: &Arc<Self>, uuid: &str) -> Arc<Self> {
        self.held_bases.lock().unwrap().insert(uuid.to_string());
        self.clone()
    }

    pub fn content(&self, disk_uuid: &str) -> Option<Bytes> {
        self.contents.lock().unwrap().get(disk_uuid).cloned()
    }
}

#[async_trait]
impl WriterSink for RecordingWriter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, is_full: bool) -> anyhow::Result<()> {
        self.prepared.lock().unwrap().push(is_full);
        if self.fail_prepare.load(Ordering::Relaxed) {
            anyhow::bail!("target unavailable");
        }
        Ok(())
    }

    async fn check_base_vdis(&self, candidates: &mut BaseVdiMap) -> anyhow::Result<()> {
        let held = self.held_bases.lock().unwrap().clone();
        candidates.retain(|uuid, _| held.contains(uuid.as_str()));
        Ok(())
    }

    async fn transfer(&self, payload: TransferPayload) -> anyhow::Result<()> {
        if self.fail_transfer.load(Ordering::Relaxed) {
            anyhow::bail!("write failed");
        }
        for (uuid, value) in &payload.differencing {
            self.differencing
                .lock()
                .unwrap()
                .insert(uuid.as_str().to_string(), *value);
        }
        for (uuid, disk) in payload.delta.streams {
            let content = collect(disk.stream).await?;
            self.contents
                .lock()
                .unwrap()
                .insert(uuid.as_str().to_string(), content);
        }
        Ok(())
    }

    async fn update_uuid_and_chain(&self, payload: ChainUpdatePayload) -> anyhow::Result<()> {
        self.chain_updates.lock().unwrap().push(payload);
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.cleanups.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Writer that lands each transferred disk as a file in a temp directory.
pub struct DirWriter {
    name: String,
    pub dir: tempfile::TempDir,
}

impl DirWriter {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            dir: tempfile::tempdir().expect("create temp dir"),
        })
    }

    pub fn disk_path(&self, disk_uuid: &str) -> std::path::PathBuf {
        self.dir.path().join(format!("{disk_uuid}.vhd"))
    }
}

#[async_trait]
impl WriterSink for DirWriter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, _is_full: bool) -> anyhow::Result<()> {
        Ok(())
    }

    async fn transfer(&self, payload: TransferPayload) -> anyhow::Result<()> {
        for (uuid, disk) in payload.delta.streams {
            let content = collect(disk.stream).await?;
            std::fs::write(self.disk_path(uuid.as_str()), &content)?;
        }
        Ok(())
    }

    async fn update_uuid_and_chain(&self, _payload: ChainUpdatePayload) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub const LIVE_DISK_UUID: &str = "11111111-1111-1111-1111-111111111111";
pub const SNAP_DISK_UUID: &str = "22222222-2222-2222-2222-222222222222";
pub const BASE_DISK_UUID: &str = "33333333-3333-3333-3333-333333333333";

/// One VM with one disk, its frozen export snapshot, and an NBD fabric
/// serving the snapshot disk's content.
pub struct Scenario {
    pub gateway: Arc<FakeGateway>,
    pub nbd: Arc<NbdFabric>,
    pub vm_ref: VmRef,
    pub snapshot_ref: VmRef,
    pub live_disk: VdiRef,
    pub snap_disk: VdiRef,
    pub base_disk: VdiRef,
}

impl Scenario {
    pub fn vm(&self) -> VmRecord {
        self.gateway
            .state
            .lock()
            .unwrap()
            .vms
            .get(&self.vm_ref)
            .cloned()
            .unwrap()
    }

    pub fn snapshot(&self) -> VmRecord {
        self.gateway
            .state
            .lock()
            .unwrap()
            .vms
            .get(&self.snapshot_ref)
            .cloned()
            .unwrap()
    }

    /// Register a base snapshot of the live disk for [`JOB_ID`].
    pub fn add_base(&self) {
        let mut state = self.gateway.state.lock().unwrap();
        let mut other_config = OtherConfig::new();
        other_config.insert(keys::JOB.into(), JOB_ID.into());
        other_config.insert(keys::DATETIME.into(), "2026-08-27T03:00:00Z".into());
        let virtual_size = state.vdis[&self.live_disk].virtual_size;
        state.vdis.insert(
            self.base_disk.clone(),
            VdiRecord {
                reference: self.base_disk.clone(),
                uuid: VdiUuid::new(BASE_DISK_UUID),
                name_label: "root (base)".into(),
                virtual_size,
                cbt_enabled: true,
                snapshot_of: Some(self.live_disk.clone()),
                sr: SrRef::new("OpaqueRef:sr1"),
                other_config,
                sm_config: OtherConfig::new(),
            },
        );
        state
            .vdi_snapshots
            .entry(self.live_disk.clone())
            .or_default()
            .push(self.base_disk.clone());
    }

    pub fn set_vm_chain_length(&self, value: &str) {
        let mut state = self.gateway.state.lock().unwrap();
        state
            .vms
            .get_mut(&self.vm_ref)
            .unwrap()
            .other_config
            .insert(keys::CHAIN_LENGTH.into(), value.into());
    }

    /// Change map between the base and the snapshot disk, MSB-first bits
    /// over 64 KiB regions.
    pub fn set_changed_bits(&self, bits: Vec<u8>) {
        let mut state = self.gateway.state.lock().unwrap();
        state.changed.insert(
            (self.base_disk.clone(), self.snap_disk.clone()),
            Bytes::from(bits),
        );
    }
}

/// Build the standard one-disk scenario; `image` is the snapshot disk's
/// raw content and also its virtual size.
pub fn scenario(image: Bytes) -> Scenario {
    let gateway = Arc::new(FakeGateway::default());
    let nbd = Arc::new(NbdFabric::default());

    let vm_ref = VmRef::new("OpaqueRef:vm1");
    let snapshot_ref = VmRef::new("OpaqueRef:snap1");
    let live_disk = VdiRef::new("OpaqueRef:disk-a");
    let snap_disk = VdiRef::new("OpaqueRef:snap-a");
    let base_disk = VdiRef::new("OpaqueRef:base-a");

    {
        let mut state = gateway.state.lock().unwrap();

        let master = HostRef::new("OpaqueRef:host1");
        state.hosts.insert(
            master.clone(),
            HostRecord {
                reference: master.clone(),
                name_label: "host1".into(),
                address: "10.0.0.1".into(),
            },
        );
        state.master = Some(master);

        let sr = SrRef::new("OpaqueRef:sr1");
        state.srs.insert(
            sr.clone(),
            SrRecord {
                reference: sr.clone(),
                name_label: "local storage".into(),
                sr_type: "lvm".into(),
            },
        );

        state.vms.insert(
            vm_ref.clone(),
            VmRecord {
                reference: vm_ref.clone(),
                uuid: VmUuid::new("aaaa0000-0000-0000-0000-000000000001"),
                name_label: "web01".into(),
                is_a_snapshot: false,
                other_config: OtherConfig::new(),
            },
        );
        state.vms.insert(
            snapshot_ref.clone(),
            VmRecord {
                reference: snapshot_ref.clone(),
                uuid: VmUuid::new("aaaa0000-0000-0000-0000-000000000002"),
                name_label: "web01 (backup)".into(),
                is_a_snapshot: true,
                other_config: OtherConfig::new(),
            },
        );

        state.vdis.insert(
            live_disk.clone(),
            VdiRecord {
                reference: live_disk.clone(),
                uuid: VdiUuid::new(LIVE_DISK_UUID),
                name_label: "root".into(),
                virtual_size: image.len() as u64,
                cbt_enabled: true,
                snapshot_of: None,
                sr: sr.clone(),
                other_config: OtherConfig::new(),
                sm_config: OtherConfig::new(),
            },
        );
        state.vdis.insert(
            snap_disk.clone(),
            VdiRecord {
                reference: snap_disk.clone(),
                uuid: VdiUuid::new(SNAP_DISK_UUID),
                name_label: "root (backup)".into(),
                virtual_size: image.len() as u64,
                cbt_enabled: true,
                snapshot_of: Some(live_disk.clone()),
                sr,
                other_config: OtherConfig::new(),
                sm_config: OtherConfig::new(),
            },
        );

        state.vm_disks.insert(vm_ref.clone(), vec![live_disk.clone()]);
        state
            .vm_disks
            .insert(snapshot_ref.clone(), vec![snap_disk.clone()]);

        state.nbd.insert(
            snap_disk.clone(),
            vec![NbdEndpoint {
                address: "10.0.0.1".into(),
                port: 10809,
                export_name: "snap-a".into(),
            }],
        );
    }

    nbd.serve("snap-a", image);

    Scenario {
        gateway,
        nbd,
        vm_ref,
        snapshot_ref,
        live_disk,
        snap_disk,
        base_disk,
    }
}
