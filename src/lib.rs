#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # logbus-rpc
//!
//! This crate provides an RPC framework layered over a log-based
//! pub/sub messaging substrate (ordered, fragment-reassembled byte
//! streams per `(channel, stream_id)`, offered to and polled from
//! non-blockingly).
//!
//! ## Feature
//!
//! - Request/response with correlation ids, deadlines and a timeout reaper
//! - Server streaming with in-order delivery and a single terminal signal
//! - Smooth weighted round-robin endpoint selection (plus round-robin,
//!   random, weighted-random and least-connections strategies)
//! - Client-side token-bucket rate limiting
//! - Lock-free per-service and global metrics
//!
//! ## Components
//!
//! `logbus-rpc` is built from a collection of crates that provide different
//! functionalities:
//!
//! - [`logbus-rpc-core`](https://docs.rs/logbus-rpc-core): serializer and
//!   substrate contracts, errors, channel configuration, idle strategies
//! - [`logbus-rpc-codec`](https://docs.rs/logbus-rpc-codec): `Serializer`
//!   implementations (JSON, msgpack)
//!
//! The substrate itself is pluggable through
//! [`Publication`]/[`Subscription`]; the [`inproc`] module ships an
//! in-process implementation used by the tests.
//!
//! ## Usage
//!
//! 1. Choose a serializer from `logbus-rpc-codec`.
//! 2. Attach publications/subscriptions for the request and response
//!    streams (`aeron:ipc`, `aeron:udp?endpoint=...`).
//! 3. Register unary/streaming handlers and `start` the server.
//! 4. Build a client, optionally with a resolver, balancer strategy and
//!    rate limiter, and `call`/`stream`.
//!
//! ## Example
//!
//! ```rust
//! use logbus_rpc::client::{ClientBuilder, ClientConfig};
//! use logbus_rpc::inproc::LogBus;
//! use logbus_rpc::metrics::MonitoringService;
//! use logbus_rpc::server::{RpcServer, ServerConfig};
//! use logbus_rpc::{ChannelConfig, RpcError};
//! use logbus_rpc_codec::JsonSerializer;
//! use std::sync::Arc;
//!
//! fn setup_server(bus: &LogBus) -> Result<RpcServer<JsonSerializer>, RpcError> {
//!     let requests = ChannelConfig::ipc(1001);
//!     let replies = ChannelConfig::ipc(1002);
//!     let server = RpcServer::new(
//!         ServerConfig::default(),
//!         Box::new(bus.add_subscription(&requests)),
//!         Arc::new(bus.add_publication(&replies)),
//!         JsonSerializer::default(),
//!         Arc::new(MonitoringService::new()),
//!     )?;
//!     server.register("echo", |payload: Vec<u8>| async move { Ok(payload) })?;
//!     server.start()?;
//!     Ok(server)
//! }
//!
//! async fn use_client(bus: &LogBus) -> Result<(), RpcError> {
//!     let requests = ChannelConfig::ipc(1001);
//!     let replies = ChannelConfig::ipc(1002);
//!     let client = ClientBuilder::new(ClientConfig::default(), JsonSerializer::default())
//!         .build(
//!             Arc::new(bus.add_publication(&requests)),
//!             Box::new(bus.add_subscription(&replies)),
//!         )?;
//!     let reply = client.call("echo", "_", b"Hello RPC!").await?;
//!     assert_eq!(reply, b"Hello RPC!");
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate captains_log;

pub mod balancer;
pub mod client;
pub mod endpoint;
pub mod inproc;
pub mod limiter;
pub mod metrics;
pub mod pending;
pub mod proto;
pub mod server;

// re-export the contracts so that users don't need multiple crates
pub use logbus_rpc_core::error::RpcError;
pub use logbus_rpc_core::idle::IdleStrategy;
pub use logbus_rpc_core::transport::{OfferOutcome, Publication, Subscription};
pub use logbus_rpc_core::{ChannelConfig, Serializer};
