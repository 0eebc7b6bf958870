//! Running byte-count observation for a disk stream.

use crate::stream::ByteStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle on the running byte count of a watched stream.
#[derive(Debug, Clone, Default)]
pub struct SizeWatcher(Arc<AtomicU64>);

impl SizeWatcher {
    /// Bytes that have passed through the watched stream so far.
    pub fn bytes(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Wrap a stream so its byte count can be observed without altering the
/// content.
pub fn watch_size(stream: ByteStream) -> (SizeWatcher, ByteStream) {
    let watcher = SizeWatcher::default();
    let counter = watcher.0.clone();
    let watched = stream.map(move |chunk| {
        if let Ok(bytes) = &chunk {
            counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        chunk
    });
    (watcher, Box::pin(watched))
}
