use std::time::Duration;

const BACKOFF_SHIFT_CAP: u32 = 16;

/// Pause policy applied when a poll cycle reads nothing or an offer is
/// back-pressured.
///
/// The attempt counter is kept by the caller and reset to zero whenever
/// work is done, so `Backoff` ramps from `min` to `max` across
/// consecutive empty cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStrategy {
    /// Spin without yielding to the scheduler. Lowest latency, one core burned.
    BusySpin,
    /// Yield the task back to the scheduler.
    Yield,
    /// Sleep a fixed duration.
    Sleep(Duration),
    /// Exponential backoff doubling from `min` up to `max`.
    Backoff { min: Duration, max: Duration },
}

impl Default for IdleStrategy {
    fn default() -> Self {
        Self::Backoff { min: Duration::from_micros(50), max: Duration::from_millis(1) }
    }
}

impl IdleStrategy {
    pub async fn idle(&self, attempt: u32) {
        match self {
            Self::BusySpin => std::hint::spin_loop(),
            Self::Yield => tokio::task::yield_now().await,
            Self::Sleep(d) => tokio::time::sleep(*d).await,
            Self::Backoff { min, max } => {
                tokio::time::sleep(backoff_delay(*min, *max, attempt)).await
            }
        }
    }
}

fn backoff_delay(min: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.min(BACKOFF_SHIFT_CAP);
    let nanos = (min.as_nanos() as u64).saturating_shl(shift);
    Duration::from_nanos(nanos).min(max)
}

trait SaturatingShl {
    fn saturating_shl(self, shift: u32) -> Self;
}

impl SaturatingShl for u64 {
    #[inline]
    fn saturating_shl(self, shift: u32) -> u64 {
        if shift >= self.leading_zeros() { u64::MAX } else { self << shift }
    }
}
