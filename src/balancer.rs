use crate::endpoint::ServiceEndpoint;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;

/// Endpoint selection policy.
///
/// `LeastConnections` relies on the caller reporting in-flight counts via
/// [`LoadBalancer::increment_connections`] /
/// [`LoadBalancer::decrement_connections`] around each send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    RoundRobin,
    Random,
    Weighted,
    #[default]
    SmoothWeighted,
    LeastConnections,
}

/// Per-endpoint state of the smooth weighted round-robin.
///
/// `weight` remembers the endpoint weight the node was built from, so a
/// weight change is detected as a replacement and the counter restarts.
struct SwrrNode {
    endpoint_id: String,
    weight: i32,
    effective_weight: i32,
    current_weight: i64,
}

impl SwrrNode {
    fn new(endpoint: &ServiceEndpoint) -> Self {
        let weight = endpoint.weight.max(0);
        Self {
            endpoint_id: endpoint.id.clone(),
            weight,
            effective_weight: weight,
            current_weight: 0,
        }
    }
}

pub struct LoadBalancer {
    strategy: Strategy,
    swrr_nodes: Mutex<HashMap<String, Vec<SwrrNode>>>,
    rr_counters: Mutex<HashMap<String, usize>>,
    connections: Mutex<HashMap<String, i64>>,
}

impl LoadBalancer {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            swrr_nodes: Mutex::new(HashMap::new()),
            rr_counters: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Pick an endpoint for `service`, or `None` when the list is empty.
    pub fn select<'a>(
        &self, service: &str, endpoints: &'a [ServiceEndpoint],
    ) -> Option<&'a ServiceEndpoint> {
        if endpoints.is_empty() {
            return None;
        }
        match self.strategy {
            Strategy::RoundRobin => self.select_round_robin(service, endpoints),
            Strategy::Random => {
                let i = rand::thread_rng().gen_range(0..endpoints.len());
                Some(&endpoints[i])
            }
            Strategy::Weighted => Some(select_weighted_random(endpoints)),
            Strategy::SmoothWeighted => self.select_swrr(service, endpoints),
            Strategy::LeastConnections => self.select_least_connections(endpoints),
        }
    }

    fn select_round_robin<'a>(
        &self, service: &str, endpoints: &'a [ServiceEndpoint],
    ) -> Option<&'a ServiceEndpoint> {
        let mut counters = self.rr_counters.lock().unwrap();
        let counter = counters.entry(service.to_string()).or_insert(0);
        let i = *counter % endpoints.len();
        *counter = counter.wrapping_add(1);
        Some(&endpoints[i])
    }

    /// The smooth variant: every selection adds each node's effective
    /// weight to its running counter, picks the largest counter, then
    /// subtracts the weight total from the winner. Over Σw selections
    /// each endpoint wins exactly its weight's share, interleaved.
    fn select_swrr<'a>(
        &self, service: &str, endpoints: &'a [ServiceEndpoint],
    ) -> Option<&'a ServiceEndpoint> {
        let mut table = self.swrr_nodes.lock().unwrap();
        let old = table.remove(service).unwrap_or_default();
        let mut nodes = reconcile(old, endpoints);

        let total: i64 = nodes.iter().map(|n| n.effective_weight as i64).sum();
        let selected = if total == 0 {
            // all weights zero: deterministic tie-breaker
            0
        } else {
            let mut best = 0usize;
            let mut best_weight = i64::MIN;
            for (i, node) in nodes.iter_mut().enumerate() {
                node.current_weight += node.effective_weight as i64;
                // strictly greater keeps the lowest index on ties
                if node.current_weight > best_weight {
                    best = i;
                    best_weight = node.current_weight;
                }
            }
            nodes[best].current_weight -= total;
            best
        };
        table.insert(service.to_string(), nodes);
        Some(&endpoints[selected])
    }

    fn select_least_connections<'a>(
        &self, endpoints: &'a [ServiceEndpoint],
    ) -> Option<&'a ServiceEndpoint> {
        let counts = self.connections.lock().unwrap();
        let mut best = 0usize;
        let mut best_count = i64::MAX;
        for (i, ep) in endpoints.iter().enumerate() {
            let count = counts.get(&ep.id).copied().unwrap_or(0);
            if count < best_count {
                best = i;
                best_count = count;
            }
        }
        Some(&endpoints[best])
    }

    pub fn increment_connections(&self, endpoint: &ServiceEndpoint) {
        let mut counts = self.connections.lock().unwrap();
        *counts.entry(endpoint.id.clone()).or_insert(0) += 1;
    }

    pub fn decrement_connections(&self, endpoint: &ServiceEndpoint) {
        let mut counts = self.connections.lock().unwrap();
        *counts.entry(endpoint.id.clone()).or_insert(0) -= 1;
    }

    /// Forget all per-service and per-endpoint state.
    pub fn clear(&self) {
        self.swrr_nodes.lock().unwrap().clear();
        self.rr_counters.lock().unwrap().clear();
        self.connections.lock().unwrap().clear();
    }
}

/// Rebuild the node list in endpoint order: nodes for absent endpoints
/// are dropped, new endpoints (or ones whose weight changed) start from
/// a zero counter.
fn reconcile(mut old: Vec<SwrrNode>, endpoints: &[ServiceEndpoint]) -> Vec<SwrrNode> {
    let mut nodes = Vec::with_capacity(endpoints.len());
    for ep in endpoints {
        let kept = old
            .iter()
            .position(|n| n.endpoint_id == ep.id && n.weight == ep.weight.max(0))
            .map(|i| old.swap_remove(i));
        nodes.push(kept.unwrap_or_else(|| SwrrNode::new(ep)));
    }
    nodes
}

fn select_weighted_random(endpoints: &[ServiceEndpoint]) -> &ServiceEndpoint {
    let total: i64 = endpoints.iter().map(|e| e.weight.max(0) as i64).sum();
    if total == 0 {
        return &endpoints[0];
    }
    let mut remaining = rand::thread_rng().gen_range(0..total);
    for ep in endpoints {
        remaining -= ep.weight.max(0) as i64;
        if remaining < 0 {
            return ep;
        }
    }
    &endpoints[endpoints.len() - 1]
}
