//! # logbus-rpc-core
//!
//! Core contracts shared by the `logbus-rpc` family of crates:
//!
//! - the [`Serializer`] trait consumed by the engines (implementations in
//!   [logbus-rpc-codec](https://docs.rs/logbus-rpc-codec))
//! - the error taxonomy in [`error`]
//! - [`ChannelConfig`] describing a `(channel, stream_id)` address on the
//!   underlying log-based messaging substrate
//! - the substrate contracts in [`transport`]
//! - the pause policies in [`idle`]

mod codec;
pub use codec::Serializer;
mod config;
pub use config::ChannelConfig;
pub mod error;
pub mod idle;
pub mod transport;
