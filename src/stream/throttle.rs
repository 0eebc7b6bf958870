//! Shared rate limiting for disk streams.
//!
//! A token bucket shared by every disk stream of a run. Pull-based: a
//! reader that is paced stops pulling, so backpressure reaches the source
//! transport instead of piling up in buffers.

use crate::stream::ByteStream;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

struct BucketState {
    available: f64,
    last_refill: Instant,
}

struct Bucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

/// Shared byte-rate limiter. Cheap to clone; clones share the bucket.
#[derive(Clone)]
pub struct Throttle {
    bucket: Option<Arc<Bucket>>,
}

impl Throttle {
    /// A limiter at `bytes_per_sec`, with a burst of one second's worth of
    /// tokens. 0 disables limiting.
    pub fn new(bytes_per_sec: u64) -> Self {
        let bucket = (bytes_per_sec > 0).then(|| {
            Arc::new(Bucket {
                rate: bytes_per_sec as f64,
                burst: bytes_per_sec as f64,
                state: Mutex::new(BucketState {
                    available: bytes_per_sec as f64,
                    last_refill: Instant::now(),
                }),
            })
        });
        Self { bucket }
    }

    /// Take `amount` tokens, sleeping as long as the bucket is in deficit.
    /// Requests larger than the burst are allowed and paid off over time.
    pub async fn acquire(&self, amount: usize) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        let wait = {
            let mut state = bucket.state.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.available = (state.available + elapsed * bucket.rate).min(bucket.burst);
            state.last_refill = now;
            state.available -= amount as f64;
            if state.available < 0.0 {
                Duration::from_secs_f64(-state.available / bucket.rate)
            } else {
                Duration::ZERO
            }
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    /// Pace a stream: tokens for each chunk are taken before it is
    /// yielded downstream.
    pub fn wrap(&self, stream: ByteStream) -> ByteStream {
        if self.bucket.is_none() {
            return stream;
        }
        let throttle = self.clone();
        Box::pin(stream.then(move |chunk| {
            let throttle = throttle.clone();
            async move {
                if let Ok(bytes) = &chunk {
                    throttle.acquire(bytes.len()).await;
                }
                chunk
            }
        }))
    }
}
