//! # logbus-rpc-codec
//!
//! [`Serializer`] implementations for
//! [logbus-rpc](https://docs.rs/logbus-rpc):
//!
//! - [`JsonSerializer`]: human-readable, `application/json`
//! - [`MsgpSerializer`]: compact binary, `application/msgpack`

pub use logbus_rpc_core::Serializer;

mod json;
pub use json::JsonSerializer;
mod msgpack;
pub use msgpack::MsgpSerializer;
