//! Disk stream pipeline.
//!
//! A disk export is a pull-based stream of [`Bytes`] chunks. Transforms
//! apply in a fixed order: differencing detection first (it must see the
//! unmodified leading bytes), then size watching, then optional structural
//! validation, then throttling as the last backpressure-propagating stage.

pub mod differencing;
pub mod fork;
pub mod throttle;
pub mod validator;
pub mod watch;

pub use differencing::detect_differencing;
pub use fork::fork_stream;
pub use throttle::Throttle;
pub use validator::validate_vhd;
pub use watch::{watch_size, SizeWatcher};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use std::pin::Pin;
use tokio::sync::mpsc;

/// A readable disk content stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// Bounded channel capacity between a stream pump task and its reader.
pub const PIPE_CHANNEL_SIZE: usize = 16;

/// Wrap the receiving half of a pump channel as a [`ByteStream`].
pub fn channel_stream(rx: mpsc::Receiver<io::Result<Bytes>>) -> ByteStream {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// Build a stream from in-memory chunks.
pub fn from_chunks(chunks: Vec<Bytes>) -> ByteStream {
    Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)))
}

/// Drain a stream into one buffer.
pub async fn collect(mut stream: ByteStream) -> io::Result<Bytes> {
    let mut out = bytes::BytesMut::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out.freeze())
}

pub(crate) fn io_err(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::Other, message.into())
}
