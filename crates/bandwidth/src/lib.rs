//! Write-side bandwidth pacing.
//!
//! The transfer engine has no explicit flow-control window; TCP and pipe
//! buffering provide backpressure. When a byte-per-second cap is
//! configured, the writer simply sleeps after each chunk in proportion to
//! the bytes it just pushed, which keeps average throughput at or
//! slightly below the cap.

use std::num::NonZeroU64;
use std::time::{Duration, Instant};

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Sleep-after-write limiter.
///
/// # Examples
///
/// ```
/// use bandwidth::BandwidthLimiter;
/// use std::num::NonZeroU64;
///
/// let mut limiter = BandwidthLimiter::new(NonZeroU64::new(1 << 20).unwrap());
/// let slept = limiter.register(4096);
/// assert!(slept <= std::time::Duration::from_millis(10));
/// ```
#[derive(Clone, Debug)]
pub struct BandwidthLimiter {
    limit_bytes: NonZeroU64,
    last_write: Option<Instant>,
}

impl BandwidthLimiter {
    /// Creates a limiter capped at `limit` bytes per second.
    #[must_use]
    pub fn new(limit: NonZeroU64) -> Self {
        Self {
            limit_bytes: limit,
            last_write: None,
        }
    }

    /// Returns the configured limit in bytes per second.
    #[inline]
    #[must_use]
    pub const fn limit_bytes(&self) -> NonZeroU64 {
        self.limit_bytes
    }

    /// Records `bytes` written and sleeps long enough to keep the average
    /// rate under the cap. Returns the duration actually requested.
    pub fn register(&mut self, bytes: usize) -> Duration {
        if bytes == 0 {
            return Duration::ZERO;
        }

        let pause = self.pause_for(bytes);
        let pause = match self.last_write.replace(Instant::now()) {
            // credit time that already passed since the previous write
            Some(previous) => pause.saturating_sub(previous.elapsed()),
            None => pause,
        };

        if !pause.is_zero() {
            std::thread::sleep(pause);
        }
        pause
    }

    fn pause_for(&self, bytes: usize) -> Duration {
        let micros = (bytes as u64)
            .saturating_mul(MICROS_PER_SECOND)
            .checked_div(self.limit_bytes.get())
            .unwrap_or(0);
        Duration::from_micros(micros)
    }
}
