use crate::error::RpcError;
use serde::{Deserialize, Serialize};

/// Pluggable payload encoding consumed by the engines.
///
/// Implementations live in
/// [logbus-rpc-codec](https://docs.rs/logbus-rpc-codec). Engines share
/// one instance across threads and treat it as stateless; anything an
/// implementation keeps internally (ciphers, dictionaries) needs its own
/// interior mutability.
///
/// Failures surface as [`RpcError::Serialization`] carrying the
/// underlying encoder's message. The engines forward them to the caller
/// as the request's terminal error and never retry an encode.
pub trait Serializer: Default + Send + Sync + Sized + 'static {
    /// MIME-style tag describing the encoding, e.g. `application/json`.
    fn content_type(&self) -> &'static str;

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, RpcError>;

    /// Append the encoded value to `buf`, returning the number of bytes
    /// written. Lets a caller assemble a frame without an intermediate
    /// allocation per payload.
    fn serialize_into<T: Serialize>(&self, value: &T, buf: &mut Vec<u8>)
        -> Result<usize, RpcError>;

    fn deserialize<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, RpcError>;
}
