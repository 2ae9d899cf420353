use crate::client::StreamSubscriber;
use logbus_rpc_core::error::RpcError;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;

/// Completion side of one in-flight request.
pub enum ReplyWaiter {
    Unary(oneshot::Sender<Result<Vec<u8>, RpcError>>),
    Stream(Arc<dyn StreamSubscriber>),
}

/// Table entry owned exclusively by [`PendingTable`]; the caller keeps
/// only the receiving half of the completion.
pub struct PendingReply {
    pub waiter: ReplyWaiter,
    pub service: String,
    pub deadline: Instant,
    pub created_at: Instant,
}

impl PendingReply {
    /// One-shot terminal completion. A dropped receiver is fine, the
    /// caller simply stopped waiting.
    pub fn complete(self, result: Result<Vec<u8>, RpcError>) {
        match self.waiter {
            ReplyWaiter::Unary(tx) => {
                let _ = tx.send(result);
            }
            ReplyWaiter::Stream(subscriber) => match result {
                Ok(_) => subscriber.on_complete(),
                Err(e) => subscriber.on_error(e),
            },
        }
    }
}

/// Routing decision for a RESPONSE frame.
pub enum ResponseRoute {
    /// Entry removed; complete it with the payload.
    Unary(PendingReply),
    /// Entry stays registered; deliver to the subscriber.
    Stream(Arc<dyn StreamSubscriber>),
}

/// Correlation id -> waiter map with deadlines.
///
/// Exactly one remover wins any entry (reply handler, reaper, or
/// shutdown drain); a `remove` that returns `None` means the payload in
/// hand is stale and must be dropped without signalling.
#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<FxHashMap<u64, PendingReply>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: u64, entry: PendingReply) -> Result<(), RpcError> {
        use std::collections::hash_map::Entry;
        let mut inner = self.inner.lock().unwrap();
        match inner.entry(id) {
            Entry::Occupied(_) => Err(RpcError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    pub fn remove(&self, id: u64) -> Option<PendingReply> {
        self.inner.lock().unwrap().remove(&id)
    }

    /// Route a RESPONSE frame: unary entries come out of the table,
    /// streaming entries are only borrowed (COMPLETE/ERROR ends them).
    pub fn route_response(&self, id: u64) -> Option<ResponseRoute> {
        let mut inner = self.inner.lock().unwrap();
        if let ReplyWaiter::Stream(subscriber) = &inner.get(&id)?.waiter {
            return Some(ResponseRoute::Stream(subscriber.clone()));
        }
        inner.remove(&id).map(ResponseRoute::Unary)
    }

    /// Remove an entry for a stream terminator. A unary entry stays put:
    /// COMPLETE only ever applies to streaming replies.
    pub fn remove_stream(&self, id: u64) -> Option<Arc<dyn StreamSubscriber>> {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(inner.get(&id)?.waiter, ReplyWaiter::Stream(_)) {
            return None;
        }
        match inner.remove(&id) {
            Some(PendingReply { waiter: ReplyWaiter::Stream(subscriber), .. }) => Some(subscriber),
            _ => None,
        }
    }

    /// Collect expired entries under the lock; the reaper completes them
    /// outside it.
    pub fn sweep_expired(&self, now: Instant) -> Vec<(u64, PendingReply)> {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<u64> =
            inner.iter().filter(|(_, e)| e.deadline <= now).map(|(id, _)| *id).collect();
        expired.into_iter().filter_map(|id| inner.remove(&id).map(|e| (id, e))).collect()
    }

    /// Empty the table on shutdown.
    pub fn drain(&self) -> Vec<(u64, PendingReply)> {
        self.inner.lock().unwrap().drain().collect()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unary_entry(ttl: Duration) -> (PendingReply, oneshot::Receiver<Result<Vec<u8>, RpcError>>) {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let entry = PendingReply {
            waiter: ReplyWaiter::Unary(tx),
            service: "svc".to_string(),
            deadline: now + ttl,
            created_at: now,
        };
        (entry, rx)
    }

    #[test]
    fn test_insert_duplicate_fails() {
        let table = PendingTable::new();
        let (a, _rx_a) = unary_entry(Duration::from_secs(1));
        let (b, _rx_b) = unary_entry(Duration::from_secs(1));
        table.insert(7, a).expect("insert");
        assert_eq!(table.insert(7, b), Err(RpcError::DuplicateId(7)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_is_one_shot() {
        let table = PendingTable::new();
        let (entry, _rx) = unary_entry(Duration::from_secs(1));
        table.insert(1, entry).expect("insert");
        assert!(table.remove(1).is_some());
        assert!(table.remove(1).is_none());
    }

    #[test]
    fn test_sweep_takes_only_expired() {
        let table = PendingTable::new();
        let (expired, _rx1) = unary_entry(Duration::ZERO);
        let (alive, _rx2) = unary_entry(Duration::from_secs(60));
        table.insert(1, expired).expect("insert");
        table.insert(2, alive).expect("insert");

        let swept = table.sweep_expired(Instant::now());
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0, 1);
        assert!(table.contains(2));
        assert!(!table.contains(1));
    }

    #[test]
    fn test_sweeper_and_handler_race_one_winner() {
        let table = PendingTable::new();
        let (entry, mut rx) = unary_entry(Duration::ZERO);
        table.insert(1, entry).expect("insert");

        // handler wins
        let won = table.remove(1).expect("remove");
        assert!(table.sweep_expired(Instant::now()).is_empty());
        won.complete(Ok(b"late but fine".to_vec()));
        assert!(rx.try_recv().expect("recv").is_ok());
    }

    #[test]
    fn test_completion_after_receiver_dropped() {
        let table = PendingTable::new();
        let (entry, rx) = unary_entry(Duration::from_secs(1));
        table.insert(1, entry).expect("insert");
        drop(rx);
        // must not panic
        table.remove(1).expect("remove").complete(Err(RpcError::Cancelled));
    }

    #[test]
    fn test_drain() {
        let table = PendingTable::new();
        let (a, _rx_a) = unary_entry(Duration::from_secs(1));
        let (b, _rx_b) = unary_entry(Duration::from_secs(1));
        table.insert(1, a).expect("insert");
        table.insert(2, b).expect("insert");
        assert_eq!(table.drain().len(), 2);
        assert!(table.is_empty());
    }
}
