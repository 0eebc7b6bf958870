//! Minimal knowledge of the VHD container layout.
//!
//! Just enough of the on-disk structure to detect a differencing disk,
//! validate a stream, and emit a container from an NBD read path: footer,
//! dynamic header, block allocation table, and the sector constants tying
//! them together. Wire layout is big-endian throughout.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

pub const SECTOR_SIZE: usize = 512;
pub const FOOTER_SIZE: usize = 512;
pub const DYNAMIC_HEADER_SIZE: usize = 1024;

/// Data block size used by emitted containers.
pub const DEFAULT_BLOCK_SIZE: u32 = 2 * 1024 * 1024;

pub const FOOTER_COOKIE: &[u8; 8] = b"conectix";
pub const DYNAMIC_HEADER_COOKIE: &[u8; 8] = b"cxsparse";

/// BAT entry for a block with no data in this container.
pub const BAT_UNALLOCATED: u32 = 0xFFFF_FFFF;

const CREATOR_APPLICATION: &[u8; 4] = b"vbak";
const CREATOR_VERSION: u32 = 0x0003_0000;
const FILE_FORMAT_VERSION: u32 = 0x0001_0000;
const HEADER_VERSION: u32 = 0x0001_0000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("truncated structure: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("bad cookie")]
    BadCookie,
    #[error("bad checksum")]
    BadChecksum,
    #[error("unknown disk type {0}")]
    UnknownDiskType(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DiskType {
    Fixed = 2,
    Dynamic = 3,
    Differencing = 4,
}

impl DiskType {
    pub fn from_u32(value: u32) -> Result<Self, ParseError> {
        match value {
            2 => Ok(Self::Fixed),
            3 => Ok(Self::Dynamic),
            4 => Ok(Self::Differencing),
            other => Err(ParseError::UnknownDiskType(other)),
        }
    }
}

/// Ones-complement byte-sum checksum with the checksum field zeroed.
pub fn checksum(buf: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u32 = 0;
    for (i, b) in buf.iter().enumerate() {
        if (checksum_offset..checksum_offset + 4).contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(*b as u32);
    }
    !sum
}

/// Seconds since the VHD epoch (2000-01-01 UTC), saturating.
pub fn vhd_timestamp(now: DateTime<Utc>) -> u32 {
    let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    (now - epoch).num_seconds().clamp(0, u32::MAX as i64) as u32
}

/// Parse a textual UUID into the 16-byte field the container stores.
/// Non-hex characters (dashes) are skipped; short input is zero-padded.
pub fn uuid_bytes(uuid: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let mut nibbles = uuid.chars().filter_map(|c| c.to_digit(16));
    for slot in out.iter_mut() {
        match (nibbles.next(), nibbles.next()) {
            (Some(hi), Some(lo)) => *slot = ((hi << 4) | lo) as u8,
            (Some(hi), None) => {
                *slot = (hi << 4) as u8;
                break;
            }
            _ => break,
        }
    }
    out
}

fn chs_geometry(size: u64) -> (u16, u8, u8) {
    let mut total_sectors = (size / SECTOR_SIZE as u64).min(65535 * 16 * 255);
    let (mut sectors_per_track, mut heads): (u64, u64);
    let mut cylinder_times_heads;
    if total_sectors >= 65535 * 16 * 63 {
        total_sectors = 65535 * 16 * 255;
        sectors_per_track = 255;
        heads = 16;
        cylinder_times_heads = total_sectors / sectors_per_track;
    } else {
        sectors_per_track = 17;
        cylinder_times_heads = total_sectors / sectors_per_track;
        heads = ((cylinder_times_heads + 1023) / 1024).max(4);
        if cylinder_times_heads >= heads * 1024 || heads > 16 {
            sectors_per_track = 31;
            heads = 16;
            cylinder_times_heads = total_sectors / sectors_per_track;
        }
        if cylinder_times_heads >= heads * 1024 {
            sectors_per_track = 63;
            heads = 16;
            cylinder_times_heads = total_sectors / sectors_per_track;
        }
    }
    let cylinders = cylinder_times_heads / heads;
    (cylinders as u16, heads as u8, sectors_per_track as u8)
}

/// The 512-byte footer that opens and closes every non-fixed container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub current_size: u64,
    pub disk_type: DiskType,
    pub uuid: [u8; 16],
    pub timestamp: u32,
}

impl Footer {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FOOTER_SIZE);
        buf.put_slice(FOOTER_COOKIE);
        buf.put_u32(2); // features: reserved bit always set
        buf.put_u32(FILE_FORMAT_VERSION);
        buf.put_u64(FOOTER_SIZE as u64); // data offset: header follows
        buf.put_u32(self.timestamp);
        buf.put_slice(CREATOR_APPLICATION);
        buf.put_u32(CREATOR_VERSION);
        buf.put_slice(b"Lnux");
        buf.put_u64(self.current_size); // original size
        buf.put_u64(self.current_size);
        let (cylinders, heads, sectors) = chs_geometry(self.current_size);
        buf.put_u16(cylinders);
        buf.put_u8(heads);
        buf.put_u8(sectors);
        buf.put_u32(self.disk_type as u32);
        buf.put_u32(0); // checksum placeholder
        buf.put_slice(&self.uuid);
        buf.put_u8(0); // saved state
        buf.resize(FOOTER_SIZE, 0);
        let sum = checksum(&buf, 64);
        buf[64..68].copy_from_slice(&sum.to_be_bytes());
        buf.freeze()
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < FOOTER_SIZE {
            return Err(ParseError::Truncated {
                need: FOOTER_SIZE,
                have: buf.len(),
            });
        }
        let buf = &buf[..FOOTER_SIZE];
        if &buf[0..8] != FOOTER_COOKIE {
            return Err(ParseError::BadCookie);
        }
        let stored = u32::from_be_bytes(buf[64..68].try_into().unwrap());
        if stored != checksum(buf, 64) {
            return Err(ParseError::BadChecksum);
        }
        let disk_type =
            DiskType::from_u32(u32::from_be_bytes(buf[60..64].try_into().unwrap()))?;
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&buf[68..84]);
        Ok(Self {
            current_size: u64::from_be_bytes(buf[48..56].try_into().unwrap()),
            disk_type,
            uuid,
            timestamp: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
        })
    }
}

/// The 1024-byte header of dynamic and differencing containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicHeader {
    pub table_offset: u64,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub parent_uuid: [u8; 16],
    pub parent_timestamp: u32,
}

impl DynamicHeader {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DYNAMIC_HEADER_SIZE);
        buf.put_slice(DYNAMIC_HEADER_COOKIE);
        buf.put_u64(u64::MAX); // data offset: unused
        buf.put_u64(self.table_offset);
        buf.put_u32(HEADER_VERSION);
        buf.put_u32(self.max_table_entries);
        buf.put_u32(self.block_size);
        buf.put_u32(0); // checksum placeholder
        buf.put_slice(&self.parent_uuid);
        buf.put_u32(self.parent_timestamp);
        buf.resize(DYNAMIC_HEADER_SIZE, 0);
        let sum = checksum(&buf, 36);
        buf[36..40].copy_from_slice(&sum.to_be_bytes());
        buf.freeze()
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < DYNAMIC_HEADER_SIZE {
            return Err(ParseError::Truncated {
                need: DYNAMIC_HEADER_SIZE,
                have: buf.len(),
            });
        }
        let buf = &buf[..DYNAMIC_HEADER_SIZE];
        if &buf[0..8] != DYNAMIC_HEADER_COOKIE {
            return Err(ParseError::BadCookie);
        }
        let stored = u32::from_be_bytes(buf[36..40].try_into().unwrap());
        if stored != checksum(buf, 36) {
            return Err(ParseError::BadChecksum);
        }
        let mut parent_uuid = [0u8; 16];
        parent_uuid.copy_from_slice(&buf[40..56]);
        Ok(Self {
            table_offset: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            max_table_entries: u32::from_be_bytes(buf[28..32].try_into().unwrap()),
            block_size: u32::from_be_bytes(buf[32..36].try_into().unwrap()),
            parent_uuid,
            parent_timestamp: u32::from_be_bytes(buf[56..60].try_into().unwrap()),
        })
    }
}

/// Encode a block allocation table, padded to a whole number of sectors.
pub fn encode_bat(entries: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(entries.len() * 4);
    for entry in entries {
        buf.put_u32(*entry);
    }
    let padded = buf.len().div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
    buf.resize(padded.max(SECTOR_SIZE), 0xFF);
    buf.freeze()
}

/// Sectors occupied by a BAT with the given entry count.
pub fn bat_sectors(max_table_entries: u32) -> u64 {
    ((max_table_entries as u64 * 4).div_ceil(SECTOR_SIZE as u64)).max(1)
}
