// src/limiter.rs

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Bandwidth cap shared by every transfer that holds a clone.
#[derive(Clone, Debug)]
pub struct SpeedLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
}

#[derive(Debug)]
struct TokenBucket {
    /// Burst size in bytes; equal to one second of traffic.
    capacity: u64,
    tokens: u64,
    /// Bytes per second. 0 disables the limiter.
    rate: u64,
    last_refill: Instant,
}

impl SpeedLimiter {
    /// A rate of 0 means unlimited.
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket {
                capacity: rate_bytes_per_sec,
                tokens: rate_bytes_per_sec,
                rate: rate_bytes_per_sec,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Waits until `amount` bytes may be written.
    ///
    /// Amounts larger than the burst size are admitted in burst-sized pieces,
    /// so a single large chunk cannot wait forever.
    pub async fn take(&self, amount: u64) {
        let mut outstanding = amount;
        while outstanding > 0 {
            let mut bucket = self.bucket.lock().await;
            if bucket.rate == 0 {
                return;
            }
            bucket.refill();

            let wanted = outstanding.min(bucket.capacity);
            if bucket.tokens >= wanted {
                bucket.tokens -= wanted;
                outstanding -= wanted;
                continue;
            }

            let missing = wanted - bucket.tokens;
            let wait = Duration::from_secs_f64(missing as f64 / bucket.rate as f64);
            // Never sleep while holding the bucket.
            drop(bucket);
            tokio::time::sleep(wait).await;
        }
    }
}

impl TokenBucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let earned = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        if earned > 0 {
            self.tokens = (self.tokens + earned).min(self.capacity);
            self.last_refill = now;
        }
    }
}
