//! Typed RPC gateway to the hypervisor pool.
//!
//! The wire client (connection handling, retry of transient call
//! failures, resource HTTP endpoints) is an external collaborator; this
//! trait is the surface the export engine consumes.

use crate::error::Result;
use crate::platform::types::{
    ChangedBlocks, HostRecord, HostRef, NbdEndpoint, SrRecord, SrRef, TaskRef, VdiFormat,
    VdiRecord, VdiRef, VmRecord, VmRef,
};
use crate::stream::ByteStream;
use async_trait::async_trait;

/// Query for the bulk disk export resource endpoint.
#[derive(Debug, Clone)]
pub struct RawExportRequest {
    pub format: VdiFormat,
    pub vdi: VdiRef,
    /// When set, the platform produces a delta bitstream against this base.
    pub base: Option<VdiRef>,
    pub task: TaskRef,
}

/// Query for the bulk disk import resource endpoint.
#[derive(Debug, Clone)]
pub struct RawImportRequest {
    pub format: VdiFormat,
    pub vdi: VdiRef,
    pub task: TaskRef,
}

#[async_trait]
pub trait RpcGateway: Send + Sync {
    async fn vm_record(&self, vm: &VmRef) -> Result<VmRecord>;
    async fn vdi_record(&self, vdi: &VdiRef) -> Result<VdiRecord>;
    async fn host_record(&self, host: &HostRef) -> Result<HostRecord>;
    async fn sr_record(&self, sr: &SrRef) -> Result<SrRecord>;

    /// Reference of the pool's primary node.
    async fn pool_master(&self) -> Result<HostRef>;

    /// Disk images currently attached to a VM, in platform order.
    async fn vm_disks(&self, vm: &VmRef) -> Result<Vec<VdiRef>>;

    /// Snapshots of one disk. Ordered by creation, not guaranteed sorted.
    async fn vdi_snapshots(&self, vdi: &VdiRef) -> Result<Vec<VdiRef>>;

    /// Change map of `vdi` relative to `base`, from the platform's change
    /// tracking feature.
    async fn list_changed_blocks(&self, base: &VdiRef, vdi: &VdiRef) -> Result<ChangedBlocks>;

    /// Advertised NBD export endpoints for a disk. May be empty.
    async fn nbd_info(&self, vdi: &VdiRef) -> Result<Vec<NbdEndpoint>>;

    async fn create_task(&self, label: &str) -> Result<TaskRef>;
    async fn set_task_progress(&self, task: &TaskRef, progress: f64) -> Result<()>;

    /// Bulk disk export over the resource HTTP endpoint.
    async fn export_raw_vdi(&self, request: RawExportRequest) -> Result<ByteStream>;

    /// Bulk disk import over the resource HTTP endpoint.
    async fn import_raw_vdi(&self, request: RawImportRequest, content: ByteStream) -> Result<()>;

    /// Set (`Some`) or delete (`None`) one metadata key on a VM.
    async fn update_vm_other_config(
        &self,
        vm: &VmRef,
        key: &str,
        value: Option<&str>,
    ) -> Result<()>;

    /// Set (`Some`) or delete (`None`) one metadata key on a VDI.
    async fn update_vdi_other_config(
        &self,
        vdi: &VdiRef,
        key: &str,
        value: Option<&str>,
    ) -> Result<()>;

    /// Destroy a disk. Callers that treat a missing disk as success should
    /// go through [`crate::platform::vdi::VdiOps::destroy`].
    async fn destroy_vdi(&self, vdi: &VdiRef) -> Result<()>;
}
