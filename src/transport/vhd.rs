//! VHD container stream built from an NBD read path.
//!
//! Emits a dynamic or differencing container for a disk read over NBD.
//! With a changed-block map only the blocks containing changed regions
//! are allocated; without one every block is read (full block read).

use crate::platform::types::{ChangedBlocks, VdiUuid};
use crate::stream::{channel_stream, ByteStream, PIPE_CHANNEL_SIZE};
use crate::transport::nbd::MultiNbdClient;
use crate::vhd::{
    bat_sectors, encode_bat, uuid_bytes, vhd_timestamp, DiskType, DynamicHeader, Footer,
    BAT_UNALLOCATED, DEFAULT_BLOCK_SIZE, DYNAMIC_HEADER_SIZE, FOOTER_SIZE, SECTOR_SIZE,
};
use bytes::Bytes;
use chrono::Utc;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identity carried by an emitted container so later stages produce a
/// correctly linked chain member.
#[derive(Debug, Clone)]
pub struct DiskIdentity {
    pub virtual_size: u64,
    pub uuid: VdiUuid,
    /// Container UUID of the base image; present for delta exports.
    pub base_uuid: Option<VdiUuid>,
}

/// Progress observer, called with a completion ratio in `0.0..=1.0`.
pub type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;

/// Stream a VHD container for the export behind `client`.
///
/// The client connection is released when the stream completes, fails,
/// or its reader goes away.
pub fn vhd_stream(
    client: Arc<MultiNbdClient>,
    identity: DiskIdentity,
    changed: Option<ChangedBlocks>,
    progress: Option<ProgressFn>,
) -> ByteStream {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(PIPE_CHANNEL_SIZE);
    tokio::spawn(async move {
        if let Err(err) = pump(&client, &identity, changed.as_ref(), progress.as_ref(), &tx).await
        {
            let _ = tx.send(Err(err)).await;
        }
        client.disconnect().await;
    });
    channel_stream(rx)
}

/// True when any changed region intersects the given container block.
fn block_has_changes(
    changed: &ChangedBlocks,
    block_index: u64,
    block_size: u64,
    virtual_size: u64,
) -> bool {
    let start = block_index * block_size;
    let end = (start + block_size).min(virtual_size);
    let first_region = start / ChangedBlocks::BLOCK_SIZE;
    let last_region = end.div_ceil(ChangedBlocks::BLOCK_SIZE);
    (first_region..last_region).any(|region| changed.is_changed(region))
}

async fn pump(
    client: &MultiNbdClient,
    identity: &DiskIdentity,
    changed: Option<&ChangedBlocks>,
    progress: Option<&ProgressFn>,
    tx: &mpsc::Sender<io::Result<Bytes>>,
) -> io::Result<()> {
    let block_size = DEFAULT_BLOCK_SIZE as u64;
    let table_entries = identity.virtual_size.div_ceil(block_size) as u32;

    let allocated: Vec<bool> = (0..table_entries as u64)
        .map(|index| match changed {
            None => true,
            Some(map) => block_has_changes(map, index, block_size, identity.virtual_size),
        })
        .collect();

    // sector bitmap (1 sector for 2 MiB blocks) + data sectors
    let bitmap_sectors = (block_size / SECTOR_SIZE as u64 / 8).div_ceil(SECTOR_SIZE as u64);
    let sectors_per_block = bitmap_sectors + block_size / SECTOR_SIZE as u64;

    let mut bat = vec![BAT_UNALLOCATED; table_entries as usize];
    let mut next_sector =
        ((FOOTER_SIZE + DYNAMIC_HEADER_SIZE) / SECTOR_SIZE) as u64 + bat_sectors(table_entries);
    for (index, present) in allocated.iter().enumerate() {
        if *present {
            bat[index] = next_sector as u32;
            next_sector += sectors_per_block;
        }
    }

    let timestamp = vhd_timestamp(Utc::now());
    let disk_type = if identity.base_uuid.is_some() {
        DiskType::Differencing
    } else {
        DiskType::Dynamic
    };
    let footer = Footer {
        current_size: identity.virtual_size,
        disk_type,
        uuid: uuid_bytes(identity.uuid.as_str()),
        timestamp,
    }
    .encode();
    let header = DynamicHeader {
        table_offset: (FOOTER_SIZE + DYNAMIC_HEADER_SIZE) as u64,
        max_table_entries: table_entries,
        block_size: DEFAULT_BLOCK_SIZE,
        parent_uuid: identity
            .base_uuid
            .as_ref()
            .map(|uuid| uuid_bytes(uuid.as_str()))
            .unwrap_or_default(),
        parent_timestamp: timestamp,
    }
    .encode();

    send(tx, footer.clone()).await?;
    send(tx, header).await?;
    send(tx, encode_bat(&bat)).await?;

    let bitmap = Bytes::from(vec![0xFFu8; (bitmap_sectors * SECTOR_SIZE as u64) as usize]);
    let allocated_total = allocated.iter().filter(|present| **present).count();
    let mut done = 0usize;

    for (index, present) in allocated.iter().enumerate() {
        if !*present {
            continue;
        }
        let start = index as u64 * block_size;
        let end = (start + block_size).min(identity.virtual_size);
        let data = client
            .read(start, (end - start) as u32)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        send(tx, bitmap.clone()).await?;
        send(tx, data).await?;
        if end - start < block_size {
            // last block extends past the disk end; zero-fill
            send(tx, Bytes::from(vec![0u8; (block_size - (end - start)) as usize])).await?;
        }

        done += 1;
        if let Some(report) = progress {
            report(done as f64 / allocated_total.max(1) as f64);
        }
    }

    send(tx, footer).await?;
    Ok(())
}

async fn send(tx: &mpsc::Sender<io::Result<Bytes>>, bytes: Bytes) -> io::Result<()> {
    tx.send(Ok(bytes))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stream reader went away"))
}
