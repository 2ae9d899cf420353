use logbus_rpc_core::error::RpcError;
use logbus_rpc_core::Serializer;
use serde::{Deserialize, Serialize};

/// Binary serializer producing MessagePack payloads.
///
/// The default writes structs as maps with field names, so payloads stay
/// decodable when either side reorders or extends its types.
/// [`MsgpSerializer::compact`] switches to positional arrays, trading
/// that tolerance for the smallest frames; use it only when both ends
/// ship the same type definitions.
pub struct MsgpSerializer {
    named_fields: bool,
}

impl Default for MsgpSerializer {
    fn default() -> Self {
        Self { named_fields: true }
    }
}

impl MsgpSerializer {
    /// Positional encoding without field names.
    pub fn compact() -> Self {
        Self { named_fields: false }
    }
}

impl Serializer for MsgpSerializer {
    #[inline(always)]
    fn content_type(&self) -> &'static str {
        "application/msgpack"
    }

    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, RpcError> {
        let encoded = if self.named_fields {
            rmp_serde::encode::to_vec_named(value)
        } else {
            rmp_serde::encode::to_vec(value)
        };
        encoded.map_err(|e| RpcError::Serialization(e.to_string()))
    }

    fn serialize_into<T: Serialize>(
        &self, value: &T, buf: &mut Vec<u8>,
    ) -> Result<usize, RpcError> {
        let pre_len = buf.len();
        let written = if self.named_fields {
            rmp_serde::encode::write_named(buf, value)
        } else {
            rmp_serde::encode::write(buf, value)
        };
        written.map_err(|e| RpcError::Serialization(e.to_string()))?;
        Ok(buf.len() - pre_len)
    }

    #[inline]
    fn deserialize<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, RpcError> {
        rmp_serde::decode::from_slice(buf).map_err(|e| RpcError::Serialization(e.to_string()))
    }
}
