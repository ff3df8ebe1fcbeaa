//! # muxwire
//!
//! Client for a framed, multiplexed, length-prefixed RPC protocol, plus
//! a cluster client that pools connections to peer servers.
//!
//! A single connection carries many concurrent in-flight requests;
//! responses are correlated back to their callers by sequence number.
//! Each [`Client`] runs a reader, a single coalescing writer, and a
//! timeout scavenger; callers park on a per-call waiter until one of
//! them signals completion. [`ClusterClient`] spreads calls over a set
//! of clients round-robin and re-dials nodes that fail.
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use muxwire::{Client, Network};
//!
//! #[tokio::main]
//! async fn main() -> muxwire::Result<()> {
//!     let client = Client::dial(Network::Tcp, "127.0.0.1:7000", Duration::from_secs(1)).await?;
//!
//!     let mut reply = String::new();
//!     client.call(1, Some("hello"), Some(&mut reply)).await?;
//!
//!     client.close().await
//! }
//! ```
//!
//! TLS and other exotic transports are the caller's business: wrap the
//! stream yourself and hand it to [`Client::from_stream`].

pub mod codec;
pub mod links;
pub mod protocol;
pub mod transport;

mod client;
mod cluster;
mod command;
mod error;
mod pending;
mod waiter;

pub use client::{AsyncResponse, Client};
pub use cluster::{ClusterClient, ClusterConfig, ClusterStatus};
pub use error::{MuxwireError, Result};
pub use links::Link;
pub use protocol::Status;
pub use transport::Network;
