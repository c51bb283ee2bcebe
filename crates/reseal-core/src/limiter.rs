//! Token bucket shared by every worker of a run
//!
//! Worker count and request rate are separate knobs: any number of workers
//! draw from the same bucket.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::cancel::CancelSignal;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens added per second
    refill_rate: f64,
    /// Bucket capacity (maximum burst)
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Allow `requests` per second with a burst of the same size
    pub fn per_second(requests: u32) -> Self {
        Self::new(requests, requests)
    }

    pub fn new(requests_per_second: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            refill_rate: f64::from(requests_per_second.max(1)),
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait for one token. Returns false if cancelled while waiting.
    pub async fn acquire(&self, cancel: &CancelSignal) -> bool {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return true;
                }
                self.time_until_available(&bucket)
            };
            if !cancel.sleep(wait).await {
                return false;
            }
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;
    }

    fn time_until_available(&self, bucket: &Bucket) -> Duration {
        let needed = (1.0 - bucket.tokens).max(0.0);
        Duration::from_secs_f64(needed / self.refill_rate)
    }
}
