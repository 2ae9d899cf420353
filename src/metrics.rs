use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MIN_UNSET: u64 = u64::MAX;

/// Counters for one service (or the global aggregate).
///
/// All updates are atomic RMW; max/min run CAS loops. Processing time is
/// tracked in nanoseconds.
pub struct RpcMetrics {
    requests: AtomicU64,
    responses: AtomicU64,
    errors: AtomicU64,
    timeout_errors: AtomicU64,
    bytes: AtomicU64,
    dropped_replies: AtomicU64,
    processing_sum: AtomicU64,
    processing_max: AtomicU64,
    processing_min: AtomicU64,
}

impl Default for RpcMetrics {
    fn default() -> Self {
        Self {
            requests: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeout_errors: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            dropped_replies: AtomicU64::new(0),
            processing_sum: AtomicU64::new(0),
            processing_max: AtomicU64::new(0),
            processing_min: AtomicU64::new(MIN_UNSET),
        }
    }
}

impl RpcMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self, bytes: u64, processing: Duration) {
        self.responses.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        let nanos = processing.as_nanos() as u64;
        self.processing_sum.fetch_add(nanos, Ordering::Relaxed);
        update_max(&self.processing_max, nanos);
        update_min(&self.processing_min, nanos);
    }

    pub fn record_error(&self, is_timeout: bool) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if is_timeout {
            self.timeout_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_dropped_reply(&self) {
        self.dropped_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let min = self.processing_min.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeout_errors: self.timeout_errors.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            dropped_replies: self.dropped_replies.load(Ordering::Relaxed),
            processing_sum_nanos: self.processing_sum.load(Ordering::Relaxed),
            processing_max_nanos: self.processing_max.load(Ordering::Relaxed),
            processing_min_nanos: if min == MIN_UNSET { 0 } else { min },
        }
    }

    pub fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.responses.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.timeout_errors.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.dropped_replies.store(0, Ordering::Relaxed);
        self.processing_sum.store(0, Ordering::Relaxed);
        self.processing_max.store(0, Ordering::Relaxed);
        self.processing_min.store(MIN_UNSET, Ordering::Relaxed);
    }
}

fn update_max(slot: &AtomicU64, value: u64) {
    let mut current = slot.load(Ordering::Relaxed);
    while value > current {
        match slot.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

fn update_min(slot: &AtomicU64, value: u64) {
    let mut current = slot.load(Ordering::Relaxed);
    while value < current {
        match slot.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

/// Point-in-time copy of one [`RpcMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub responses: u64,
    pub errors: u64,
    pub timeout_errors: u64,
    pub bytes: u64,
    pub dropped_replies: u64,
    pub processing_sum_nanos: u64,
    pub processing_max_nanos: u64,
    /// 0 when no response has been recorded yet
    pub processing_min_nanos: u64,
}

impl MetricsSnapshot {
    pub fn average_processing_nanos(&self) -> f64 {
        if self.responses == 0 {
            0.0
        } else {
            self.processing_sum_nanos as f64 / self.responses as f64
        }
    }
}

/// Per-service metrics plus the global aggregate.
///
/// Injected into the engines at construction; a service queried before
/// any traffic gets a zero-initialized entry.
#[derive(Default)]
pub struct MonitoringService {
    global: RpcMetrics,
    services: Mutex<HashMap<String, Arc<RpcMetrics>>>,
}

impl MonitoringService {
    pub fn new() -> Self {
        Self { global: RpcMetrics::new(), services: Mutex::new(HashMap::new()) }
    }

    pub fn record_request(&self, service: &str) {
        self.global.record_request();
        self.service_metrics(service).record_request();
    }

    pub fn record_response(&self, service: &str, bytes: u64, processing: Duration) {
        self.global.record_response(bytes, processing);
        self.service_metrics(service).record_response(bytes, processing);
    }

    pub fn record_error(&self, service: &str, is_timeout: bool) {
        self.global.record_error(is_timeout);
        self.service_metrics(service).record_error(is_timeout);
    }

    pub fn record_dropped_reply(&self, service: &str) {
        self.global.record_dropped_reply();
        self.service_metrics(service).record_dropped_reply();
    }

    pub fn service_metrics(&self, service: &str) -> Arc<RpcMetrics> {
        let mut services = self.services.lock().unwrap();
        services.entry(service.to_string()).or_insert_with(|| Arc::new(RpcMetrics::new())).clone()
    }

    #[inline]
    pub fn global(&self) -> &RpcMetrics {
        &self.global
    }

    pub fn service_snapshot(&self, service: &str) -> MetricsSnapshot {
        self.service_metrics(service).snapshot()
    }

    pub fn reset_service(&self, service: &str) {
        if let Some(metrics) = self.services.lock().unwrap().get(service) {
            metrics.reset();
        }
    }

    pub fn reset_all(&self) {
        self.global.reset();
        for metrics in self.services.lock().unwrap().values() {
            metrics.reset();
        }
    }
}
