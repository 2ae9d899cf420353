//! In-process reference implementation of the substrate contracts.
//!
//! Log semantics: every subscription of a `(channel, stream_id)` stream
//! observes every offered frame, in offer order. Queues are bounded per
//! subscriber; a full subscriber back-pressures the publication, so the
//! engines' offer/idle paths are exercised for real. An offer with no
//! live subscriber is accepted and the frame dropped, like publishing to
//! an unconnected stream.

use logbus_rpc_core::transport::{OfferOutcome, Publication, Subscription};
use logbus_rpc_core::ChannelConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const DEFAULT_BUS_CAPACITY: usize = 1024;

struct SubQueue {
    frames: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    closed: AtomicBool,
}

type Subscribers = Arc<Mutex<Vec<Arc<SubQueue>>>>;

/// An owned set of in-process log streams. No global state: attach
/// publications and subscriptions through a shared `LogBus` instance.
pub struct LogBus {
    capacity: usize,
    channels: Mutex<HashMap<(String, i32), Subscribers>>,
}

impl LogBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// `capacity` bounds each subscriber's queue; keep it small to
    /// provoke back-pressure in tests.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity, channels: Mutex::new(HashMap::new()) }
    }

    fn subscribers(&self, config: &ChannelConfig) -> Subscribers {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry((config.channel.clone(), config.stream_id))
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    pub fn add_publication(&self, config: &ChannelConfig) -> InprocPublication {
        InprocPublication { subscribers: self.subscribers(config), closed: AtomicBool::new(false) }
    }

    pub fn add_subscription(&self, config: &ChannelConfig) -> InprocSubscription {
        let queue = Arc::new(SubQueue {
            frames: Mutex::new(VecDeque::new()),
            capacity: self.capacity,
            closed: AtomicBool::new(false),
        });
        self.subscribers(config).lock().unwrap().push(queue.clone());
        InprocSubscription { queue }
    }
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InprocPublication {
    subscribers: Subscribers,
    closed: AtomicBool,
}

impl Publication for InprocPublication {
    fn offer(&self, frame: &[u8]) -> OfferOutcome {
        if self.closed.load(Ordering::Acquire) {
            return OfferOutcome::Closed;
        }
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|s| !s.closed.load(Ordering::Acquire));
        // a frame is either delivered to every live subscriber or to none
        for subscriber in subscribers.iter() {
            if subscriber.frames.lock().unwrap().len() >= subscriber.capacity {
                return OfferOutcome::BackPressure;
            }
        }
        for subscriber in subscribers.iter() {
            subscriber.frames.lock().unwrap().push_back(frame.to_vec());
        }
        OfferOutcome::Accepted
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub struct InprocSubscription {
    queue: Arc<SubQueue>,
}

impl Subscription for InprocSubscription {
    fn poll(&mut self, on_frame: &mut dyn FnMut(&[u8]), fragment_limit: usize) -> usize {
        if self.queue.closed.load(Ordering::Acquire) {
            return 0;
        }
        let mut read = 0;
        while read < fragment_limit {
            // take one frame at a time so on_frame runs outside the lock
            let Some(frame) = self.queue.frames.lock().unwrap().pop_front() else {
                break;
            };
            on_frame(&frame);
            read += 1;
        }
        read
    }

    fn close(&mut self) {
        self.queue.closed.store(true, Ordering::Release);
        self.queue.frames.lock().unwrap().clear();
    }
}

impl Drop for InprocSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_pair(capacity: usize) -> (InprocPublication, InprocSubscription) {
        let bus = LogBus::with_capacity(capacity);
        let config = ChannelConfig::ipc(1);
        let subscription = bus.add_subscription(&config);
        (bus.add_publication(&config), subscription)
    }

    #[test]
    fn test_offer_poll_in_order() {
        let (publication, mut subscription) = bus_pair(16);
        assert_eq!(publication.offer(b"one"), OfferOutcome::Accepted);
        assert_eq!(publication.offer(b"two"), OfferOutcome::Accepted);

        let mut seen: Vec<Vec<u8>> = Vec::new();
        let read = subscription.poll(&mut |f| seen.push(f.to_vec()), 10);
        assert_eq!(read, 2);
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(subscription.poll(&mut |_| {}, 10), 0);
    }

    #[test]
    fn test_fragment_limit() {
        let (publication, mut subscription) = bus_pair(16);
        for _ in 0..5 {
            assert_eq!(publication.offer(b"x"), OfferOutcome::Accepted);
        }
        assert_eq!(subscription.poll(&mut |_| {}, 3), 3);
        assert_eq!(subscription.poll(&mut |_| {}, 3), 2);
    }

    #[test]
    fn test_every_subscriber_sees_every_frame() {
        let bus = LogBus::new();
        let config = ChannelConfig::ipc(1);
        let mut sub_a = bus.add_subscription(&config);
        let mut sub_b = bus.add_subscription(&config);
        let publication = bus.add_publication(&config);

        assert_eq!(publication.offer(b"x"), OfferOutcome::Accepted);
        let mut count_a = 0;
        let mut count_b = 0;
        sub_a.poll(&mut |_| count_a += 1, 10);
        sub_b.poll(&mut |_| count_b += 1, 10);
        assert_eq!((count_a, count_b), (1, 1));
    }

    #[test]
    fn test_back_pressure_when_full() {
        let (publication, mut subscription) = bus_pair(1);
        assert_eq!(publication.offer(b"a"), OfferOutcome::Accepted);
        assert_eq!(publication.offer(b"b"), OfferOutcome::BackPressure);
        assert_eq!(subscription.poll(&mut |_| {}, 10), 1);
        assert_eq!(publication.offer(b"b"), OfferOutcome::Accepted);
    }

    #[test]
    fn test_unconnected_offer_is_dropped() {
        let bus = LogBus::new();
        let publication = bus.add_publication(&ChannelConfig::ipc(9));
        assert_eq!(publication.offer(b"void"), OfferOutcome::Accepted);
    }

    #[test]
    fn test_closed_publication() {
        let (publication, _subscription) = bus_pair(4);
        publication.close();
        assert!(publication.is_closed());
        assert_eq!(publication.offer(b"x"), OfferOutcome::Closed);
    }

    #[test]
    fn test_closed_subscriber_stops_back_pressuring() {
        let bus = LogBus::with_capacity(1);
        let config = ChannelConfig::ipc(1);
        let mut stuck = bus.add_subscription(&config);
        let publication = bus.add_publication(&config);
        assert_eq!(publication.offer(b"a"), OfferOutcome::Accepted);
        assert_eq!(publication.offer(b"b"), OfferOutcome::BackPressure);
        stuck.close();
        assert_eq!(publication.offer(b"b"), OfferOutcome::Accepted);
    }

    #[test]
    fn test_streams_are_independent() {
        let bus = LogBus::new();
        let mut s2 = bus.add_subscription(&ChannelConfig::ipc(2));
        let p1 = bus.add_publication(&ChannelConfig::ipc(1));
        assert_eq!(p1.offer(b"x"), OfferOutcome::Accepted);
        assert_eq!(s2.poll(&mut |_| {}, 10), 0);
    }
}
