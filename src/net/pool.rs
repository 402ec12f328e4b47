//! `HostPool`: owns a small integer count of `Connection`s to one
//! `Host`, hands one out on `borrow`, and reconnects a slot whose
//! Connection went `Defunct` according to the `ReconnectionPolicy`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::OnceCell;
use tracing::{instrument, warn};

use crate::error::{Error, Result};
use crate::net::connection::Connection;
use crate::policy::reconnection::ReconnectionPolicy;
use crate::protocol::response::PreparedResult;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Produces a freshly handshaken `Connection` to this pool's Host.
/// Separates "how to dial this host" (endpoint, socket factory, auth,
/// protocol version, pool sizing knobs) from the pool's bookkeeping, so
/// the pool only ever has to ask for a replacement and never has to know
/// how one gets built.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<Connection>>;
}

/// A small fixed-capacity set of Connections to one Host, round-robined
/// by [`HostPool::borrow`]. Connections that go `Defunct` are dropped and
/// a reconnection is scheduled on the `ReconnectionPolicy`'s backoff
/// schedule; `borrow` never blocks waiting for that to finish - it just
/// skips not-yet-ready slots.
pub struct HostPool {
    factory: Option<Arc<dyn ConnectionFactory>>,
    reconnection_policy: Option<Arc<dyn ReconnectionPolicy>>,
    target_size: usize,
    connections: RwLock<Vec<Arc<Connection>>>,
    cursor: AtomicUsize,
    /// One `OnceCell` per distinct query text ever prepared against this
    /// Host; concurrent preparers for the same text share the same cell
    /// and so coalesce to a single network `PREPARE`, the way a failed
    /// `get_or_try_init` leaves the cell empty for the next caller to retry.
    prepare_cache: Mutex<HashMap<String, Arc<OnceCell<PreparedResult>>>>,
}

impl HostPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>, reconnection_policy: Arc<dyn ReconnectionPolicy>, target_size: usize) -> Self {
        Self {
            factory: Some(factory),
            reconnection_policy: Some(reconnection_policy),
            target_size,
            connections: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            prepare_cache: Mutex::new(HashMap::new()),
        }
    }

    /// A pool with no factory, for tests and for `Host` values constructed
    /// purely to exercise load-balancing policies without real sockets.
    pub fn empty() -> Self {
        Self {
            factory: None,
            reconnection_policy: None,
            target_size: 0,
            connections: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            prepare_cache: Mutex::new(HashMap::new()),
        }
    }

    /// The coalescing cell for `query_text`, creating it on first use.
    /// Callers drive it with `OnceCell::get_or_try_init`, so a `PREPARE`
    /// already in flight for this text on this Host is awaited rather than
    /// duplicated, and a failed attempt leaves the slot open for retry.
    pub fn prepare_cache_entry(&self, query_text: &str) -> Arc<OnceCell<PreparedResult>> {
        let mut cache = self.prepare_cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(cache.entry(query_text.to_owned()).or_insert_with(|| Arc::new(OnceCell::new())))
    }

    /// Dial up to `target_size` connections; called once when a Host
    /// joins the pool (and safe to call again to top a pool back up).
    #[instrument(skip_all)]
    pub async fn fill(self: &Arc<Self>) -> Result<()> {
        let Some(factory) = &self.factory else { return Ok(()) };
        let deficit = {
            let conns = self.connections.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            self.target_size.saturating_sub(conns.len())
        };
        for _ in 0..deficit {
            match factory.connect().await {
                Ok(conn) => {
                    self.connections.write().unwrap_or_else(std::sync::PoisonError::into_inner).push(Arc::new(conn));
                }
                Err(err) => {
                    warn!(%err, "failed to fill host pool slot");
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Round-robin to the next Connection with a free stream id, reaping
    /// any Connection found Defunct along the way and scheduling its
    /// reconnection. Returns `Error::BusyConnection` if every open
    /// Connection is at capacity (the caller - `execution::coordinator` -
    /// treats this the same as a host with no slot available and moves on
    /// to the next host in its query plan).
    pub fn borrow(self: &Arc<Self>) -> Result<Arc<Connection>> {
        let mut defunct_indices = Vec::new();
        let chosen = {
            let conns = self.connections.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            if conns.is_empty() {
                return Err(Error::BusyConnection);
            }
            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % conns.len();
            let mut chosen = None;
            for offset in 0..conns.len() {
                let idx = (start + offset) % conns.len();
                let conn = &conns[idx];
                if conn.state() == crate::net::connection::ConnectionState::Defunct {
                    defunct_indices.push(idx);
                    continue;
                }
                if conn.is_ready() && conn.in_flight() < u16::MAX as usize {
                    chosen = Some(Arc::clone(conn));
                    break;
                }
            }
            chosen
        };

        if !defunct_indices.is_empty() {
            self.reap_defunct(&defunct_indices);
        }

        chosen.ok_or(Error::BusyConnection)
    }

    fn reap_defunct(self: &Arc<Self>, indices: &[usize]) {
        {
            let mut conns = self.connections.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            // Remove highest indices first so earlier indices stay valid.
            let mut sorted = indices.to_vec();
            sorted.sort_unstable_by(|a, b| b.cmp(a));
            sorted.dedup();
            for idx in sorted {
                if idx < conns.len() {
                    conns.remove(idx);
                }
            }
        }
        self.schedule_reconnect();
    }

    /// Spawn a background task that waits out the `ReconnectionPolicy`'s
    /// schedule, retrying `factory.connect()` until a slot is refilled.
    #[instrument(skip_all)]
    pub fn schedule_reconnect(self: &Arc<Self>) {
        let (Some(factory), Some(policy)) = (self.factory.clone(), self.reconnection_policy.clone()) else {
            return;
        };
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut schedule = policy.new_schedule();
            loop {
                {
                    let deficit = {
                        let conns = pool.connections.read().unwrap_or_else(std::sync::PoisonError::into_inner);
                        pool.target_size.saturating_sub(conns.len())
                    };
                    if deficit == 0 {
                        return;
                    }
                }
                let Some(delay) = schedule.next() else { return };
                tokio::time::sleep(delay).await;
                match factory.connect().await {
                    Ok(conn) => {
                        pool.connections.write().unwrap_or_else(std::sync::PoisonError::into_inner).push(Arc::new(conn));
                        return;
                    }
                    Err(err) => {
                        warn!(%err, "reconnection attempt failed, retrying on schedule");
                    }
                }
            }
        });
    }

    pub fn len(&self) -> usize {
        self.connections.read().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::RowsFlags;
    use crate::protocol::row::RowsMetadata;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    fn dummy_metadata() -> RowsMetadata {
        RowsMetadata { flags: RowsFlags::empty(), columns: Vec::new(), page_state: None, new_result_metadata_id: None }
    }

    fn dummy_prepared(id: u8) -> PreparedResult {
        PreparedResult {
            query_id: vec![id],
            result_metadata_id: None,
            variables: dummy_metadata(),
            result_metadata: dummy_metadata(),
        }
    }

    #[test]
    fn prepare_cache_entry_same_text_returns_same_cell() {
        let pool = HostPool::empty();
        let a = pool.prepare_cache_entry("select 1");
        let b = pool.prepare_cache_entry("select 1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn prepare_cache_entry_distinct_text_returns_distinct_cells() {
        let pool = HostPool::empty();
        let a = pool.prepare_cache_entry("select 1");
        let b = pool.prepare_cache_entry("select 2");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn concurrent_get_or_try_init_coalesces_to_one_initializer() {
        let pool = HostPool::empty();
        let calls = Arc::new(StdAtomicUsize::new(0));

        let cell_a = pool.prepare_cache_entry("select * from t");
        let cell_b = pool.prepare_cache_entry("select * from t");
        assert!(Arc::ptr_eq(&cell_a, &cell_b));

        let calls_a = Arc::clone(&calls);
        let fut_a = cell_a.get_or_try_init(|| async move {
            calls_a.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok::<_, Error>(dummy_prepared(1))
        });
        let calls_b = Arc::clone(&calls);
        let fut_b = cell_b.get_or_try_init(|| async move {
            calls_b.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(dummy_prepared(2))
        });

        let (a, b) = tokio::join!(fut_a, fut_b);
        assert_eq!(a.unwrap().query_id, b.unwrap().query_id);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
