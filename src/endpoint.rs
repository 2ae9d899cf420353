use logbus_rpc_core::error::RpcError;
use logbus_rpc_core::ChannelConfig;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

/// Semantic version of a service endpoint, `major.minor.patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ServiceVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServiceVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Whether a client built against `other` can talk to this endpoint.
    #[inline]
    pub fn is_compatible_with(&self, other: &ServiceVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for ServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ServiceVersion {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, RpcError> {
        let mut parts = s.split('.');
        let mut next = || -> Result<u32, RpcError> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or(RpcError::InvalidConfig("version must be major.minor.patch"))
        };
        let v = Self { major: next()?, minor: next()?, patch: next()? };
        if parts.next().is_some() {
            return Err(RpcError::InvalidConfig("version must be major.minor.patch"));
        }
        Ok(v)
    }
}

/// A reachable instance of a service.
///
/// Weight feeds the load balancer; `channel`/`stream_id` address the
/// endpoint's request stream on the substrate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceEndpoint {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub channel: String,
    pub stream_id: i32,
    pub weight: i32,
    pub version: ServiceVersion,
}

impl ServiceEndpoint {
    pub fn new(id: impl Into<String>, weight: i32) -> Self {
        Self {
            id: id.into(),
            host: "localhost".to_string(),
            port: 0,
            channel: "aeron:ipc".to_string(),
            stream_id: 1,
            weight,
            version: ServiceVersion::new(1, 0, 0),
        }
    }

    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_channel(mut self, channel: &ChannelConfig) -> Self {
        self.channel = channel.channel.clone();
        self.stream_id = channel.stream_id;
        self
    }

    pub fn with_version(mut self, version: ServiceVersion) -> Self {
        self.version = version;
        self
    }

    #[inline]
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig::new(self.channel.clone(), self.stream_id)
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{} w={} v={}", self.id, self.host, self.port, self.weight, self.version)
    }
}

/// Source of endpoints for a service name.
///
/// The returned order is significant: the SWRR balancer breaks ties by
/// list position. An empty list means the service is unknown.
pub trait EndpointResolver: Send + Sync + 'static {
    fn find_endpoints(&self, service: &str) -> Vec<ServiceEndpoint>;
}

/// In-process resolver backed by a mutex-guarded table.
#[derive(Default)]
pub struct LocalServiceRegistry {
    inner: Mutex<HashMap<String, Vec<ServiceEndpoint>>>,
}

impl LocalServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint; an existing endpoint with the same id is replaced.
    pub fn register(&self, service: &str, endpoint: ServiceEndpoint) {
        let mut inner = self.inner.lock().unwrap();
        let list = inner.entry(service.to_string()).or_default();
        match list.iter_mut().find(|e| e.id == endpoint.id) {
            Some(slot) => *slot = endpoint,
            None => list.push(endpoint),
        }
    }

    /// Returns whether an endpoint was removed.
    pub fn unregister(&self, service: &str, endpoint_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(list) = inner.get_mut(service) else {
            return false;
        };
        let before = list.len();
        list.retain(|e| e.id != endpoint_id);
        if list.is_empty() {
            inner.remove(service);
        }
        before != inner.get(service).map(|l| l.len()).unwrap_or(0)
    }

    pub fn services(&self) -> Vec<String> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }
}

impl EndpointResolver for LocalServiceRegistry {
    fn find_endpoints(&self, service: &str) -> Vec<ServiceEndpoint> {
        self.inner.lock().unwrap().get(service).cloned().unwrap_or_default()
    }
}
