//! Token bucket shared by every outbound request of one engine.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket refilled at `requests_per_minute`, holding at most `burst` tokens.
///
/// Safe to share between concurrent syncs. The bucket sits behind a short, non-async lock that
/// is never held across an `.await`, so [`RateLimiter::try_acquire`] only reports `false` when
/// no token is left.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self::with_burst(requests_per_minute, 1)
    }

    pub fn with_burst(requests_per_minute: u32, burst: u32) -> Self {
        let rpm = requests_per_minute.max(1);
        let interval = Duration::from_secs(60) / rpm;
        let interval = if interval.is_zero() {
            Duration::from_secs(1)
        } else {
            interval
        };
        let burst = f64::from(burst.max(1));

        Self {
            interval,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed / self.interval.as_secs_f64()).min(self.burst);
        bucket.last_refill = now;
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a token if one is available now; otherwise returns how long until the next one.
    fn take(&self) -> Result<(), Duration> {
        let mut bucket = self.lock();
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(self.interval.mul_f64(1.0 - bucket.tokens))
        }
    }

    /// Takes a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.take().is_ok()
    }

    /// Waits until a token is available or `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        loop {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let wait = match self.take() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            tracing::trace!("rate limiter waiting {:?}", wait);
            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(wait.max(Duration::from_millis(1))) => {}
            }
        }
    }
}
