//! Hosts and the external collaborators the coordinator consumes.
//!
//! Topology discovery, schema caching and token-ring computation are owned
//! by components outside this crate's core; `HostSet` and `ReplicaLookup`
//! are the interfaces the request coordinator (`execution::coordinator`)
//! and the token-aware load-balancing policy consume from them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::net::pool::HostPool;

/// How a load-balancing policy treats a host relative to the driver's
/// "local" datacenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distance {
    Local,
    Remote,
    Ignored,
}

/// A cluster member plus its connection pool and liveness state.
///
/// `Host` equality and hashing are by address only - two `Host` values for
/// the same `SocketAddr` are the same host even if their liveness flag
/// differs, which is what lets a tried-hosts map key on `Host` sensibly
/// when a request exhausts every host it tried.
#[derive(Clone)]
pub struct Host {
    pub address: SocketAddr,
    pub datacenter: Arc<str>,
    up: Arc<AtomicBool>,
    pub pool: Arc<HostPool>,
}

impl Host {
    pub fn new(address: SocketAddr, datacenter: impl Into<Arc<str>>, pool: Arc<HostPool>) -> Self {
        Self {
            address,
            datacenter: datacenter.into(),
            up: Arc::new(AtomicBool::new(true)),
            pool,
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn mark_up(&self) {
        self.up.store(true, Ordering::Release);
    }

    pub fn mark_down(&self) {
        self.up.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("datacenter", &self.datacenter)
            .field("up", &self.is_up())
            .finish()
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Host {}

impl std::hash::Hash for Host {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// Routing information a request may carry so a token-aware policy can
/// prepend replicas.
#[derive(Debug, Clone, Default)]
pub struct RoutingInfo {
    pub keyspace: Option<Arc<str>>,
    pub routing_key: Option<Vec<u8>>,
}

/// An iterable, change-notified view of known hosts. Owned by the topology
/// component, outside this crate's core; the coordinator and
/// load-balancing policies only ever read through this trait.
pub trait HostSet: Send + Sync {
    fn hosts(&self) -> Vec<Host>;
}

/// Token-aware replica lookup, owned by the schema/topology component
/// outside this crate's core.
pub trait ReplicaLookup: Send + Sync {
    fn replicas(&self, keyspace: &str, routing_key: &[u8]) -> Vec<Host>;
}

/// A fixed, in-memory `HostSet` useful for embedding a driver instance once
/// topology has been resolved by an external component, and for tests.
#[derive(Clone, Default)]
pub struct StaticHostSet {
    hosts: Vec<Host>,
}

impl StaticHostSet {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self { hosts }
    }
}

impl HostSet for StaticHostSet {
    fn hosts(&self) -> Vec<Host> {
        self.hosts.clone()
    }
}
