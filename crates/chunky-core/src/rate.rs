use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::error::Result;

/// Longest single sleep while waiting for tokens, so cancellation is
/// observed promptly.
const MAX_SLEEP: Duration = Duration::from_millis(50);

/// Token-bucket byte rate limiter with burst equal to the steady-state rate.
/// The bucket starts full, so the first `rate` bytes pass immediately.
///
/// A rate of zero disables limiting entirely.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: u64,
    state: Option<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        let state = (bytes_per_sec > 0).then(|| {
            Mutex::new(Bucket {
                tokens: bytes_per_sec as f64,
                last_refill: Instant::now(),
            })
        });
        Self {
            bytes_per_sec,
            state,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.state.is_none()
    }

    /// Block until `n` tokens are available, then consume them. Requests
    /// larger than the burst are drained in burst-sized slices. Returns
    /// `Canceled` if the token fires while throttled.
    pub fn acquire(&self, n: u64, cancel: &CancelToken) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };

        let rate = self.bytes_per_sec as f64;
        let burst = rate;
        let mut remaining = n as f64;

        while remaining > 0.0 {
            let want = remaining.min(burst);
            loop {
                cancel.check()?;

                let wait = {
                    let mut bucket = state.lock().unwrap();
                    let now = Instant::now();
                    let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                    bucket.tokens = (bucket.tokens + elapsed * rate).min(burst);
                    bucket.last_refill = now;

                    if bucket.tokens >= want {
                        bucket.tokens -= want;
                        None
                    } else {
                        Some(Duration::from_secs_f64((want - bucket.tokens) / rate))
                    }
                };

                match wait {
                    None => break,
                    Some(d) => std::thread::sleep(d.min(MAX_SLEEP)),
                }
            }
            remaining -= want;
        }

        Ok(())
    }
}
