//! Failover-aware client for a cluster of memcached-style cache servers.
//!
//! Keys are spread over the servers with a consistent hash ring. Every
//! server gets one persistent connection, and a failure tracker decides
//! when a misbehaving server is locked, cooled down, reconnected or removed.
//! Observers follow those transitions through a broadcast event bus.
//!
//! # Architecture
//!
//! - **Dispatcher task**: owns the ring, the health state and every pending
//!   request; the only place state changes. It keeps one job per server in
//!   flight and re-admits queued requests as each job completes.
//! - **Connection tasks**: one per server, FIFO, one request on the wire at
//!   a time.
//! - **Timer tasks**: sleep, then post an unlock or reconnect message back
//!   to the dispatcher.
//!
//! # Modules
//!
//! - [`client`]: the public [`Client`] handle
//! - [`config`]: options, server lists and their validation
//! - [`hash_ring`]: consistent hashing with virtual nodes and replicas
//! - [`connection`]: per-server socket task with timeouts and idle close
//! - [`tracker`]: lock, reconnect and removal state machine
//! - [`backoff`]: bounded exponential reconnect delays
//! - [`events`]: health notifications
//! - [`protocol`]: memcached text protocol subset
//! - [`error`]: request errors
//! - [`cli`]: command-line interface for the `cache-failover` binary

pub mod backoff;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
mod dispatcher;
pub mod error;
pub mod events;
pub mod hash_ring;
pub mod protocol;
pub mod tracker;

pub use client::Client;
pub use config::{ClientConfig, Redundancy, ServerId, ServerList, ServerSpec};
pub use error::{CacheError, ErrorKind, TransportKind};
pub use events::{EventKind, HealthEvent, IssueDetails};
pub use protocol::{Command, Response, StoreMode};
pub use tracker::IssueSnapshot;
