//! Differencing-container detection with prefix replay.
//!
//! Reads just enough of a disk stream to inspect the leading VHD footer,
//! then hands back a stream whose content is byte-identical to the
//! original, peeked prefix included. Must run before any other transform.

use crate::stream::ByteStream;
use crate::vhd::{DiskType, Footer, FOOTER_SIZE};
use bytes::BytesMut;
use futures::StreamExt;
use std::io;

/// Returns whether the stream opens with a differencing-disk footer, plus
/// a replacement stream that replays everything that was peeked.
///
/// A stream that is too short or does not open with a valid footer is
/// reported as non-differencing; strict structure checks belong to the
/// validation stage.
pub async fn detect_differencing(mut stream: ByteStream) -> io::Result<(bool, ByteStream)> {
    let mut prefix = BytesMut::new();
    while prefix.len() < FOOTER_SIZE {
        match stream.next().await {
            Some(chunk) => prefix.extend_from_slice(&chunk?),
            None => break,
        }
    }

    let is_differencing = Footer::parse(&prefix)
        .map(|footer| footer.disk_type == DiskType::Differencing)
        .unwrap_or(false);

    let replayed: ByteStream = if prefix.is_empty() {
        stream
    } else {
        Box::pin(futures::stream::once(async move { Ok(prefix.freeze()) }).chain(stream))
    };
    Ok((is_differencing, replayed))
}
