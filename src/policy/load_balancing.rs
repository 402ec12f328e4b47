//! Load-balancing policies: `new_query_plan` hands the coordinator a
//! lazy, finite, non-restartable host sequence for one request; `distance`
//! tells the connection-pool sizing in `net::pool` how many connections a
//! host deserves.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::host::{Distance, Host, HostSet, ReplicaLookup, RoutingInfo};

/// A finite, single-use sequence of hosts produced for one request.
/// Iterators are not required to be `Sync` - a plan belongs to exactly one
/// in-flight request's coordinator task.
pub type QueryPlan = Box<dyn Iterator<Item = Host> + Send>;

pub trait LoadBalancingPolicy: Send + Sync {
    fn distance(&self, host: &Host) -> Distance;

    fn new_query_plan(&self, keyspace: Option<&str>, routing: &RoutingInfo) -> QueryPlan;
}

/// Rotates over every host the `HostSet` currently reports, regardless of
/// datacenter.
pub struct RoundRobin {
    hosts: Arc<dyn HostSet>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new(hosts: Arc<dyn HostSet>) -> Self {
        Self { hosts, cursor: AtomicUsize::new(0) }
    }
}

impl LoadBalancingPolicy for RoundRobin {
    fn distance(&self, _host: &Host) -> Distance {
        Distance::Local
    }

    fn new_query_plan(&self, _keyspace: Option<&str>, _routing: &RoutingInfo) -> QueryPlan {
        let mut hosts: Vec<Host> = self.hosts.hosts().into_iter().filter(Host::is_up).collect();
        if hosts.is_empty() {
            return Box::new(std::iter::empty());
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % hosts.len();
        hosts.rotate_left(start);
        Box::new(hosts.into_iter())
    }
}

/// Rotates over the local datacenter first, then appends up to
/// `used_hosts_per_remote_dc` hosts from each remote datacenter.
pub struct DcAwareRoundRobin {
    hosts: Arc<dyn HostSet>,
    local_dc: Arc<str>,
    used_hosts_per_remote_dc: usize,
    local_cursor: AtomicUsize,
}

impl DcAwareRoundRobin {
    pub fn new(hosts: Arc<dyn HostSet>, local_dc: impl Into<Arc<str>>, used_hosts_per_remote_dc: usize) -> Self {
        Self {
            hosts,
            local_dc: local_dc.into(),
            used_hosts_per_remote_dc,
            local_cursor: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobin {
    fn distance(&self, host: &Host) -> Distance {
        if host.datacenter == self.local_dc {
            Distance::Local
        } else {
            Distance::Remote
        }
    }

    fn new_query_plan(&self, _keyspace: Option<&str>, _routing: &RoutingInfo) -> QueryPlan {
        let all = self.hosts.hosts();
        let mut local: Vec<Host> = all
            .iter()
            .filter(|h| h.is_up() && h.datacenter == self.local_dc)
            .cloned()
            .collect();

        if !local.is_empty() {
            let start = self.local_cursor.fetch_add(1, Ordering::Relaxed) % local.len();
            local.rotate_left(start);
        }

        let mut remote_by_dc: std::collections::HashMap<Arc<str>, Vec<Host>> = std::collections::HashMap::new();
        for host in all.into_iter().filter(|h| h.is_up() && h.datacenter != self.local_dc) {
            remote_by_dc.entry(Arc::clone(&host.datacenter)).or_default().push(host);
        }

        let mut plan = local;
        let mut remote_dcs: Vec<_> = remote_by_dc.into_iter().collect();
        remote_dcs.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, mut hosts) in remote_dcs {
            hosts.truncate(self.used_hosts_per_remote_dc);
            plan.extend(hosts);
        }

        Box::new(plan.into_iter())
    }
}

/// Wraps a child policy: when `routing.routing_key` is present, prepends
/// the replicas for `(keyspace, routing_key)` the child considers local,
/// deduplicated against the child's own plan, then the child's plan
/// (replicas already yielded are skipped), and finally appends any
/// replicas the child considers remote. Replicas the child would ignore
/// are dropped - an ignored host must never be contacted.
pub struct TokenAware<L: LoadBalancingPolicy> {
    child: L,
    replicas: Arc<dyn ReplicaLookup>,
}

impl<L: LoadBalancingPolicy> TokenAware<L> {
    pub fn new(child: L, replicas: Arc<dyn ReplicaLookup>) -> Self {
        Self { child, replicas }
    }
}

impl<L: LoadBalancingPolicy + 'static> LoadBalancingPolicy for TokenAware<L> {
    fn distance(&self, host: &Host) -> Distance {
        self.child.distance(host)
    }

    fn new_query_plan(&self, keyspace: Option<&str>, routing: &RoutingInfo) -> QueryPlan {
        let (Some(ks), Some(key)) = (keyspace.or(routing.keyspace.as_deref()), routing.routing_key.as_deref())
        else {
            return self.child.new_query_plan(keyspace, routing);
        };

        let mut replicas = self.replicas.replicas(ks, key);
        replicas.retain(Host::is_up);

        let mut local_replicas = Vec::new();
        let mut remote_replicas = Vec::new();
        for host in replicas {
            match self.child.distance(&host) {
                Distance::Local => local_replicas.push(host),
                Distance::Remote => remote_replicas.push(host),
                Distance::Ignored => {}
            }
        }

        let replica_addrs: HashSet<SocketAddr> =
            local_replicas.iter().chain(remote_replicas.iter()).map(|h| h.address).collect();
        let rest = self.child.new_query_plan(keyspace, routing).filter(move |h| !replica_addrs.contains(&h.address));

        Box::new(local_replicas.into_iter().chain(rest).chain(remote_replicas))
    }
}

/// Wraps a child policy: filters its plan to an allowed-address set, and
/// reports `Distance::Ignored` for anything not in it.
pub struct AllowList<L: LoadBalancingPolicy> {
    child: L,
    allowed: HashSet<SocketAddr>,
}

impl<L: LoadBalancingPolicy> AllowList<L> {
    pub fn new(child: L, allowed: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self { child, allowed: allowed.into_iter().collect() }
    }
}

impl<L: LoadBalancingPolicy + 'static> LoadBalancingPolicy for AllowList<L> {
    fn distance(&self, host: &Host) -> Distance {
        if self.allowed.contains(&host.address) {
            self.child.distance(host)
        } else {
            Distance::Ignored
        }
    }

    fn new_query_plan(&self, keyspace: Option<&str>, routing: &RoutingInfo) -> QueryPlan {
        let allowed = self.allowed.clone();
        Box::new(self.child.new_query_plan(keyspace, routing).filter(move |h| allowed.contains(&h.address)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::pool::HostPool;
    use std::sync::Arc;

    fn host(addr: &str, dc: &str) -> Host {
        Host::new(addr.parse().unwrap(), dc, Arc::new(HostPool::empty()))
    }

    #[test]
    fn round_robin_rotates_start_point() {
        let hosts = Arc::new(crate::host::StaticHostSet::new(vec![
            host("127.0.0.1:9042", "dc1"),
            host("127.0.0.2:9042", "dc1"),
            host("127.0.0.3:9042", "dc1"),
        ]));
        let lb = RoundRobin::new(hosts);
        let routing = RoutingInfo::default();
        let first: Vec<SocketAddr> = lb.new_query_plan(None, &routing).map(|h| h.address).collect();
        let second: Vec<SocketAddr> = lb.new_query_plan(None, &routing).map(|h| h.address).collect();
        assert_eq!(first.len(), 3);
        assert_ne!(first[0], second[0]);
    }

    #[test]
    fn dc_aware_prefers_local_then_remote_capped() {
        let hosts = Arc::new(crate::host::StaticHostSet::new(vec![
            host("127.0.0.1:9042", "dc1"),
            host("127.0.0.2:9042", "dc2"),
            host("127.0.0.3:9042", "dc2"),
            host("127.0.0.4:9042", "dc2"),
        ]));
        let lb = DcAwareRoundRobin::new(hosts, "dc1", 1);
        let plan: Vec<Host> = lb.new_query_plan(None, &RoutingInfo::default()).collect();
        assert_eq!(plan[0].datacenter.as_ref(), "dc1");
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn allow_list_filters_plan_and_distance() {
        let hosts = Arc::new(crate::host::StaticHostSet::new(vec![
            host("127.0.0.1:9042", "dc1"),
            host("127.0.0.2:9042", "dc1"),
        ]));
        let allowed_addr: SocketAddr = "127.0.0.1:9042".parse().unwrap();
        let lb = AllowList::new(RoundRobin::new(hosts), [allowed_addr]);
        let plan: Vec<Host> = lb.new_query_plan(None, &RoutingInfo::default()).collect();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].address, allowed_addr);
        assert_eq!(lb.distance(&plan[0]), Distance::Local);
        let other = host("127.0.0.2:9042", "dc1");
        assert_eq!(lb.distance(&other), Distance::Ignored);
    }

    struct FixedReplicas(Vec<Host>);

    impl crate::host::ReplicaLookup for FixedReplicas {
        fn replicas(&self, _keyspace: &str, _routing_key: &[u8]) -> Vec<Host> {
            self.0.clone()
        }
    }

    #[test]
    fn token_aware_prepends_local_replicas_dedupes_and_appends_remote_replicas() {
        let local_replica = host("127.0.0.1:9042", "dc1");
        let remote_replica = host("127.0.0.2:9042", "dc2");
        let plain_local = host("127.0.0.3:9042", "dc1");

        let hosts = Arc::new(crate::host::StaticHostSet::new(vec![
            local_replica.clone(),
            remote_replica.clone(),
            plain_local.clone(),
        ]));
        let child = DcAwareRoundRobin::new(hosts, "dc1", 5);
        let replicas = Arc::new(FixedReplicas(vec![local_replica.clone(), remote_replica.clone()]));
        let lb = TokenAware::new(child, replicas);

        let routing = RoutingInfo { keyspace: None, routing_key: Some(vec![1, 2, 3]) };
        let plan: Vec<SocketAddr> = lb.new_query_plan(Some("ks"), &routing).map(|h| h.address).collect();

        assert_eq!(plan, vec![local_replica.address, plain_local.address, remote_replica.address]);
    }

    #[test]
    fn token_aware_drops_replicas_the_child_ignores() {
        let ignored_replica = host("127.0.0.9:9042", "dc-ignored");
        let plain_local = host("127.0.0.3:9042", "dc1");

        let hosts = Arc::new(crate::host::StaticHostSet::new(vec![plain_local.clone()]));
        let allowed_addr = plain_local.address;
        let child = AllowList::new(RoundRobin::new(hosts), [allowed_addr]);
        let replicas = Arc::new(FixedReplicas(vec![ignored_replica, plain_local.clone()]));
        let lb = TokenAware::new(child, replicas);

        let routing = RoutingInfo { keyspace: None, routing_key: Some(vec![1]) };
        let plan: Vec<SocketAddr> = lb.new_query_plan(Some("ks"), &routing).map(|h| h.address).collect();

        assert_eq!(plan, vec![plain_local.address]);
    }
}
