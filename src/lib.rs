//! Core of a client driver for a distributed wide-column database speaking
//! the CQL binary protocol (v1-v5).
//!
//! Four tightly-coupled subsystems make up the core:
//!
//! - [`protocol`] - the frame codec (header + typed primitive readers/
//!   writers) and the streaming response parser that turns a connection's
//!   byte stream into logical items without buffering whole frames.
//! - [`net`] - `Connection` (one socket, multiplexed by stream id) and
//!   `HostPool` (a Host's set of Connections).
//! - [`execution`] - drives one user request across a query plan: host
//!   selection, retry, timeout and speculative parallel attempts.
//! - [`policy`] - the pluggable load-balancing, retry, speculative-execution
//!   and reconnection decisions the other three consult.
//!
//! Cluster topology discovery, schema caching and token-ring computation
//! are owned by components outside this crate; the coordinator only
//! consumes the [`host::HostSet`] and [`host::ReplicaLookup`] interfaces
//! from them. TLS setup and SASL handshake state machines beyond the
//! opcodes they produce are likewise external collaborators - see
//! [`auth`] and [`socket`].

pub mod auth;
pub mod config;
pub mod constant;
pub mod error;
pub mod execution;
pub mod host;
pub mod net;
pub mod policy;
pub mod protocol;
pub mod socket;
pub mod value;

pub use config::ClusterConfig;
pub use error::{Error, Result};
pub use execution::coordinator::{ExecutionResult, RequestCoordinator};
pub use execution::request::{ExecutionProfile, RequestOptions};
pub use host::Host;
pub use value::CqlValue;
