//! Hypervisor platform model: typed object references, record snapshots,
//! and the RPC gateway trait the export engine consumes.

pub mod gateway;
pub mod types;
pub mod vdi;

pub use gateway::{RawExportRequest, RawImportRequest, RpcGateway};
pub use types::{
    keys, ChangedBlocks, HostRecord, HostRef, NbdEndpoint, OtherConfig, SrRecord, SrRef, TaskRef,
    VdiFormat, VdiRecord, VdiRef, VdiUuid, VmRecord, VmRef, VmUuid,
};
pub use vdi::VdiOps;
