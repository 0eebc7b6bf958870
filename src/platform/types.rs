//! Typed references and record snapshots for hypervisor pool objects.
//!
//! The pool owns these objects; this crate holds transient read copies
//! plus the right to write specific metadata keys (see [`keys`]).

use base64::Engine;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Opaque reference to a virtual machine (live, snapshot or suspended).
    VmRef
);
opaque_id!(
    /// Opaque reference to a virtual disk image.
    VdiRef
);
opaque_id!(
    /// Opaque reference to a host.
    HostRef
);
opaque_id!(
    /// Opaque reference to a storage repository.
    SrRef
);
opaque_id!(
    /// Opaque reference to a tracked platform task.
    TaskRef
);
opaque_id!(
    /// Stable UUID of a virtual machine.
    VmUuid
);
opaque_id!(
    /// Stable UUID of a virtual disk image.
    VdiUuid
);

/// Mutable key-value metadata bag carried by platform objects.
pub type OtherConfig = BTreeMap<String, String>;

/// Metadata keys this crate reads or writes on platform objects.
pub mod keys {
    /// Job identifier stamped on each backup snapshot disk.
    pub const JOB: &str = "backup:job";
    /// RFC 3339 backup timestamp stamped on each backup snapshot disk.
    pub const DATETIME: &str = "backup:datetime";
    /// String-encoded length of the incremental chain, stored on the VM.
    pub const CHAIN_LENGTH: &str = "backup:chain-length";
    /// Marker set on an exported snapshot once its export completed.
    pub const EXPORTED: &str = "backup:exported";
    /// Task linkage set on a VDI for the duration of a content import.
    pub const IMPORT_TASK: &str = "import:task";
    /// Expected content length set on a VDI during a content import.
    pub const IMPORT_LENGTH: &str = "import:length";
    /// Container parent linkage exposed by the storage manager.
    pub const VHD_PARENT: &str = "vhd-parent";
}

/// Export/import wire format of a disk's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdiFormat {
    /// Flat byte-for-byte disk content.
    Raw,
    /// VHD container, the only format that can carry a delta.
    Vhd,
}

impl VdiFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Vhd => "vhd",
        }
    }
}

/// Snapshot of a VM record.
#[derive(Debug, Clone)]
pub struct VmRecord {
    pub reference: VmRef,
    pub uuid: VmUuid,
    pub name_label: String,
    pub is_a_snapshot: bool,
    pub other_config: OtherConfig,
}

/// Snapshot of a VDI record.
#[derive(Debug, Clone)]
pub struct VdiRecord {
    pub reference: VdiRef,
    pub uuid: VdiUuid,
    pub name_label: String,
    pub virtual_size: u64,
    pub cbt_enabled: bool,
    /// For a snapshot VDI, the live disk it was taken from.
    pub snapshot_of: Option<VdiRef>,
    pub sr: SrRef,
    pub other_config: OtherConfig,
    pub sm_config: OtherConfig,
}

impl VdiRecord {
    /// UUID of the parent container declared by the storage manager, if any.
    pub fn vhd_parent(&self) -> Option<&str> {
        self.sm_config.get(keys::VHD_PARENT).map(String::as_str)
    }
}

/// Snapshot of a host record.
#[derive(Debug, Clone)]
pub struct HostRecord {
    pub reference: HostRef,
    pub name_label: String,
    pub address: String,
}

/// Snapshot of a storage repository record.
#[derive(Debug, Clone)]
pub struct SrRecord {
    pub reference: SrRef,
    pub name_label: String,
    pub sr_type: String,
}

/// One advertised NBD export endpoint for a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbdEndpoint {
    pub address: String,
    pub port: u16,
    pub export_name: String,
}

/// Bit-per-block change map between two points in time of a disk.
///
/// Bit `i` covers the `i`-th [`ChangedBlocks::BLOCK_SIZE`] region of the
/// raw disk; a set bit means the region changed since the base.
#[derive(Debug, Clone)]
pub struct ChangedBlocks {
    bits: Bytes,
}

impl ChangedBlocks {
    /// Granularity of one bit, fixed by the platform's change tracking.
    pub const BLOCK_SIZE: u64 = 64 * 1024;

    pub fn from_bits(bits: Bytes) -> Self {
        Self { bits }
    }

    /// Decode the platform's base64 wire encoding.
    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        let bits = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        Ok(Self::from_bits(Bytes::from(bits)))
    }

    /// Whether the given 64 KiB region changed. Regions past the end of
    /// the map (the disk grew since the base) are reported as changed so
    /// they are always transferred.
    pub fn is_changed(&self, block_index: u64) -> bool {
        let byte = (block_index / 8) as usize;
        let bit = (block_index % 8) as u8;
        match self.bits.get(byte) {
            Some(b) => b & (0x80 >> bit) != 0,
            None => true,
        }
    }

    /// Number of regions covered by the map.
    pub fn len_blocks(&self) -> u64 {
        self.bits.len() as u64 * 8
    }

    /// Number of changed regions within the map.
    pub fn changed_count(&self) -> u64 {
        self.bits.iter().map(|b| b.count_ones() as u64).sum()
    }
}
