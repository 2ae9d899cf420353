use std::fmt;
use std::str::FromStr;

/// "rpc_" prefix is reserved for framework errors crossing the wire
pub const WIRE_ERR_PREFIX: &str = "rpc_";

/// Terminal outcome of an RPC operation, as observed by callers.
///
/// Unary callers observe exactly one of these as the failure of their
/// reply future; streaming subscribers observe at most one via `on_error`.
#[derive(thiserror::Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Resolver returned an empty endpoint set
    #[error("no endpoints found for service: {0}")]
    NoEndpoints(String),
    /// Deadline elapsed while offering to the publication
    #[error("timeout while offering request")]
    SendTimeout,
    /// Deadline elapsed awaiting the reply
    #[error("timeout waiting for reply")]
    ReplyTimeout,
    /// Admission denied by the client-side limiter
    #[error("rejected by rate limiter")]
    RateLimited,
    /// Server had no handler registered under the requested name
    #[error("service not found: {0}")]
    ServiceNotFound(String),
    /// User handler failed; the message travelled as the ERROR payload
    #[error("{0}")]
    Handler(String),
    /// Server worker queue saturated
    #[error("server worker queue saturated")]
    Overloaded,
    /// Decoder rejected a frame
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    /// Payload encode/decode failed
    #[error("serialization failed: {0}")]
    Serialization(String),
    /// The owning engine closed while the request was pending
    #[error("cancelled by client close")]
    Cancelled,
    /// The underlying publication or subscription is closed
    #[error("transport closed")]
    Closed,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("service already registered: {0}")]
    DuplicateService(String),
    #[error("duplicate correlation id: {0}")]
    DuplicateId(u64),
}

impl fmt::Debug for RpcError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Tags for framework errors that travel in an ERROR payload.
///
/// Anything that does not parse as one of these is a user handler error.
#[derive(strum::Display, strum::EnumString, strum::AsRefStr, PartialEq, Eq, Clone, Copy)]
enum WireErrTag {
    #[strum(serialize = "rpc_service_notfound")]
    ServiceNotFound,
    #[strum(serialize = "rpc_overloaded")]
    Overloaded,
    #[strum(serialize = "rpc_handler")]
    Handler,
}

impl RpcError {
    /// Render the error as an ERROR frame payload.
    ///
    /// Framework kinds carry their `rpc_` tag so the peer can map them
    /// back; handler errors travel as the raw message.
    pub fn to_wire(&self) -> String {
        match self {
            Self::ServiceNotFound(name) => {
                format!("{}: {}", WireErrTag::ServiceNotFound, name)
            }
            Self::Overloaded => WireErrTag::Overloaded.to_string(),
            Self::Handler(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    /// Parse an ERROR frame payload back into an error kind.
    pub fn from_wire(payload: &[u8]) -> Self {
        let Ok(s) = std::str::from_utf8(payload) else {
            return Self::Handler(format!("error blob of {} bytes", payload.len()));
        };
        let (tag, detail) = match s.split_once(':') {
            Some((tag, detail)) => (tag.trim(), detail.trim()),
            None => (s.trim(), ""),
        };
        match WireErrTag::from_str(tag) {
            Ok(WireErrTag::ServiceNotFound) => Self::ServiceNotFound(detail.to_string()),
            Ok(WireErrTag::Overloaded) => Self::Overloaded,
            Ok(WireErrTag::Handler) => Self::Handler(detail.to_string()),
            Err(_) => Self::Handler(s.to_string()),
        }
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::SendTimeout | Self::ReplyTimeout)
    }
}

impl From<&str> for RpcError {
    #[inline]
    fn from(msg: &str) -> Self {
        Self::Handler(msg.to_string())
    }
}

impl From<String> for RpcError {
    #[inline]
    fn from(msg: String) -> Self {
        Self::Handler(msg)
    }
}
