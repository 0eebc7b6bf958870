//! NBD block transport.
//!
//! The wire protocol framing lives behind [`NbdDialer`]/[`NbdChannel`]
//! (external collaborator). This module picks one endpoint among the
//! advertised candidates, opens the configured number of parallel data
//! channels, and exposes whole-disk reads as a byte stream.

use crate::error::{ExportError, Result};
use crate::platform::types::NbdEndpoint;
use crate::stream::{channel_stream, ByteStream, PIPE_CHANNEL_SIZE};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rand::Rng;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Read granularity for whole-disk streaming.
pub const READ_CHUNK: u32 = 2 * 1024 * 1024;

/// Opens one NBD data channel to an endpoint.
#[async_trait]
pub trait NbdDialer: Send + Sync {
    async fn dial(&self, endpoint: &NbdEndpoint) -> Result<Box<dyn NbdChannel>>;
}

/// One established NBD data channel.
#[async_trait]
pub trait NbdChannel: Send + Sync {
    /// Size of the export behind this channel.
    fn export_size(&self) -> u64;

    async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes>;

    async fn close(&mut self) -> Result<()>;
}

/// NBD client multiplexing reads over several parallel channels to one
/// endpoint, chosen at random from the advertised candidates to spread
/// load across hosts.
pub struct MultiNbdClient {
    channels: Vec<Mutex<Box<dyn NbdChannel>>>,
    next: AtomicUsize,
    export_size: u64,
    endpoint: NbdEndpoint,
}

impl std::fmt::Debug for MultiNbdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiNbdClient")
            .field("channels", &self.channels.len())
            .field("export_size", &self.export_size)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl MultiNbdClient {
    /// Connect `concurrency` channels (at least one). Any failure closes
    /// the channels opened so far and is reported as a connect error,
    /// which callers treat as non-fatal.
    pub async fn connect(
        dialer: &dyn NbdDialer,
        endpoints: &[NbdEndpoint],
        concurrency: usize,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(ExportError::TransportConnect(
                "no advertised NBD endpoints".into(),
            ));
        }
        let endpoint = endpoints[rand::thread_rng().gen_range(0..endpoints.len())].clone();

        let mut channels: Vec<Box<dyn NbdChannel>> = Vec::with_capacity(concurrency.max(1));
        for _ in 0..concurrency.max(1) {
            match dialer.dial(&endpoint).await {
                Ok(channel) => channels.push(channel),
                Err(err) => {
                    for mut channel in channels {
                        let _ = channel.close().await;
                    }
                    return Err(ExportError::TransportConnect(format!(
                        "{}:{}: {err}",
                        endpoint.address, endpoint.port
                    )));
                }
            }
        }

        let export_size = channels[0].export_size();
        Ok(Self {
            channels: channels.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
            export_size,
            endpoint,
        })
    }

    pub fn export_size(&self) -> u64 {
        self.export_size
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn endpoint(&self) -> &NbdEndpoint {
        &self.endpoint
    }

    /// Read one extent, dispatched round-robin over the channels.
    pub async fn read(&self, offset: u64, length: u32) -> Result<Bytes> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.channels.len();
        let mut channel = self.channels[index].lock().await;
        channel.read(offset, length).await
    }

    /// Close every channel. Best-effort: close failures are logged.
    pub async fn disconnect(&self) {
        for channel in &self.channels {
            if let Err(err) = channel.lock().await.close().await {
                warn!(endpoint = %self.endpoint.address, %err, "nbd channel close failed");
            }
        }
    }
}

/// Stream the full raw content of the export.
///
/// Reads are issued concurrently, one in flight per channel, and arrive
/// in order. The client is disconnected when the stream ends, errors, or
/// its reader goes away.
pub fn raw_stream(client: Arc<MultiNbdClient>) -> ByteStream {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(PIPE_CHANNEL_SIZE);
    tokio::spawn(async move {
        let size = client.export_size();
        let concurrency = client.channel_count();
        let chunk_count = size.div_ceil(READ_CHUNK as u64);

        let reads = futures::stream::iter(0..chunk_count)
            .map(|index| {
                let client = client.clone();
                async move {
                    let offset = index * READ_CHUNK as u64;
                    let length = (size - offset).min(READ_CHUNK as u64) as u32;
                    client.read(offset, length).await
                }
            })
            .buffered(concurrency);
        futures::pin_mut!(reads);

        while let Some(result) = reads.next().await {
            let item = result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()));
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
        client.disconnect().await;
    });
    channel_stream(rx)
}
