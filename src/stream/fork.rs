//! Bounded fan-out duplication of a disk stream.
//!
//! Every consumer gets an independent view of the same bytes. Duplication
//! is paced: a chunk is pushed to all consumers before the next one is
//! pulled from the source, so a stalled consumer backpressures the shared
//! source through its bounded channel instead of causing drops.

use crate::stream::{channel_stream, ByteStream, PIPE_CHANNEL_SIZE};
use bytes::Bytes;
use futures::StreamExt;
use std::io;
use tokio::sync::mpsc;

/// Fork a stream into `consumers` independent readers.
///
/// A consumer that is dropped early stops receiving; the remaining
/// consumers and the source are unaffected.
pub fn fork_stream(stream: ByteStream, consumers: usize) -> Vec<ByteStream> {
    match consumers {
        0 => {
            drop(stream);
            Vec::new()
        }
        1 => vec![stream],
        n => {
            let mut senders = Vec::with_capacity(n);
            let mut outputs = Vec::with_capacity(n);
            for _ in 0..n {
                let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(PIPE_CHANNEL_SIZE);
                senders.push(Some(tx));
                outputs.push(channel_stream(rx));
            }
            tokio::spawn(pump(stream, senders));
            outputs
        }
    }
}

async fn pump(mut stream: ByteStream, mut senders: Vec<Option<mpsc::Sender<io::Result<Bytes>>>>) {
    while let Some(item) = stream.next().await {
        let mut alive = 0;
        for slot in senders.iter_mut() {
            let Some(tx) = slot else { continue };
            // io::Error does not implement Clone; rebuild it per consumer
            let copy = match &item {
                Ok(bytes) => Ok(bytes.clone()),
                Err(err) => Err(io::Error::new(err.kind(), err.to_string())),
            };
            if tx.send(copy).await.is_err() {
                *slot = None;
            } else {
                alive += 1;
            }
        }
        if alive == 0 {
            return;
        }
    }
}
