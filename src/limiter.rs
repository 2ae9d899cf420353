use logbus_rpc_core::error::RpcError;
use std::sync::Mutex;
use std::time::Instant;

/// Token-bucket admission control.
///
/// Capacity is `rate_per_second * max_burst_seconds`; tokens refill
/// continuously from a monotonic clock. `try_acquire` never waits and
/// never spends partially.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    max_burst_seconds: f64,
}

struct BucketState {
    rate_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    #[inline]
    fn capacity(&self, max_burst_seconds: f64) -> f64 {
        self.rate_per_second * max_burst_seconds
    }

    fn refill(&mut self, max_burst_seconds: f64, now: Instant) {
        // Instant is monotonic, elapsed can only be >= 0
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        self.tokens =
            (self.tokens + elapsed * self.rate_per_second).min(self.capacity(max_burst_seconds));
        self.last_refill = now;
    }
}

impl TokenBucket {
    pub fn new(rate_per_second: f64, max_burst_seconds: f64) -> Result<Self, RpcError> {
        if !(rate_per_second > 0.0) || !(max_burst_seconds > 0.0) {
            return Err(RpcError::InvalidConfig("rate and burst must be positive"));
        }
        Ok(Self {
            state: Mutex::new(BucketState {
                rate_per_second,
                tokens: rate_per_second * max_burst_seconds,
                last_refill: Instant::now(),
            }),
            max_burst_seconds,
        })
    }

    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_n(1.0)
    }

    pub fn try_acquire_n(&self, permits: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        state.refill(self.max_burst_seconds, Instant::now());
        if state.tokens >= permits {
            state.tokens -= permits;
            true
        } else {
            false
        }
    }

    /// Tokens currently available. Does not mutate the bucket.
    pub fn available_permits(&self) -> f64 {
        let state = self.state.lock().unwrap();
        let elapsed = Instant::now().duration_since(state.last_refill).as_secs_f64();
        (state.tokens + elapsed * state.rate_per_second).min(state.capacity(self.max_burst_seconds))
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().unwrap().rate_per_second
    }

    /// Change the refill rate; current tokens are clamped to the new capacity.
    pub fn set_rate(&self, rate_per_second: f64) -> Result<(), RpcError> {
        if !(rate_per_second > 0.0) {
            return Err(RpcError::InvalidConfig("rate must be positive"));
        }
        let mut state = self.state.lock().unwrap();
        state.rate_per_second = rate_per_second;
        let capacity = state.capacity(self.max_burst_seconds);
        if state.tokens > capacity {
            state.tokens = capacity;
        }
        Ok(())
    }

    /// Restore the bucket to full capacity.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.tokens = state.capacity(self.max_burst_seconds);
        state.last_refill = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_invalid_config() {
        assert!(TokenBucket::new(0.0, 1.0).is_err());
        assert!(TokenBucket::new(-1.0, 1.0).is_err());
        assert!(TokenBucket::new(10.0, 0.0).is_err());
        assert!(TokenBucket::new(f64::NAN, 1.0).is_err());
    }

    #[test]
    fn test_burst_then_refill() {
        let bucket = TokenBucket::new(10.0, 1.0).expect("bucket");
        for i in 0..10 {
            assert!(bucket.try_acquire(), "acquisition {} denied within burst", i);
        }
        assert!(!bucket.try_acquire(), "acquisition beyond capacity granted");

        std::thread::sleep(Duration::from_millis(1100));
        assert!(bucket.try_acquire(), "refill after sleep did not grant");
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let bucket = TokenBucket::new(100.0, 0.1) // capacity 10
            .expect("bucket");
        std::thread::sleep(Duration::from_millis(300));
        let available = bucket.available_permits();
        assert!(available <= 10.0 + f64::EPSILON, "available {} beyond capacity", available);
    }

    #[test]
    fn test_available_permits_is_pure() {
        let bucket = TokenBucket::new(5.0, 2.0).expect("bucket");
        let a = bucket.available_permits();
        let b = bucket.available_permits();
        assert!((a - b).abs() < 0.5);
        assert!(bucket.try_acquire());
        assert!(bucket.available_permits() < a);
    }

    #[test]
    fn test_set_rate_clamps() {
        let bucket = TokenBucket::new(100.0, 1.0).expect("bucket");
        assert!(bucket.set_rate(0.0).is_err());
        bucket.set_rate(2.0).expect("set_rate");
        assert_eq!(bucket.rate(), 2.0);
        // tokens clamped from 100 down to the new capacity of 2
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_reset() {
        let bucket = TokenBucket::new(3.0, 1.0).expect("bucket");
        while bucket.try_acquire() {}
        bucket.reset();
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_acquire_n() {
        let bucket = TokenBucket::new(10.0, 1.0).expect("bucket");
        assert!(bucket.try_acquire_n(8.0));
        assert!(!bucket.try_acquire_n(5.0));
        assert!(bucket.try_acquire_n(2.0));
    }
}
