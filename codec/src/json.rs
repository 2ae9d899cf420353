use logbus_rpc_core::error::RpcError;
use logbus_rpc_core::Serializer;
use serde::{Deserialize, Serialize};

/// Text serializer producing JSON payloads.
///
/// The default choice: self-describing, inspectable on the wire with any
/// tooling, and tolerant of unknown fields on decode.
#[derive(Default)]
pub struct JsonSerializer();

impl Serializer for JsonSerializer {
    #[inline(always)]
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    #[inline]
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, RpcError> {
        serde_json::to_vec(value).map_err(|e| RpcError::Serialization(e.to_string()))
    }

    fn serialize_into<T: Serialize>(
        &self, value: &T, buf: &mut Vec<u8>,
    ) -> Result<usize, RpcError> {
        let pre_len = buf.len();
        serde_json::to_writer(&mut *buf, value)
            .map_err(|e| RpcError::Serialization(e.to_string()))?;
        Ok(buf.len() - pre_len)
    }

    #[inline]
    fn deserialize<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, RpcError> {
        serde_json::from_slice(buf).map_err(|e| RpcError::Serialization(e.to_string()))
    }
}
