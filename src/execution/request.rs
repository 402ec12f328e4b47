//! Per-request options and `ExecutionProfile`, a named bundle of the
//! policy choices a request can pin instead of taking the cluster-wide
//! defaults.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::constant::Consistency;
use crate::policy::{LoadBalancingPolicy, RetryPolicy, SpeculativeExecutionPolicy};

/// A named bundle of load-balancing, retry and speculative-execution
/// policies plus their default consistency/timeout settings - the unit a
/// `RequestOptions::execution_profile` pins a request to.
pub struct ExecutionProfile {
    pub load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub speculative_execution_policy: Arc<dyn SpeculativeExecutionPolicy>,
    pub consistency: Consistency,
    pub serial_consistency: Option<Consistency>,
    pub read_timeout: Option<Duration>,
    pub retry_on_timeout: bool,
}

/// Per-(query, parameter-type) hint, by position or by bind-marker name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hint {
    ByIndex(usize, String),
    ByName(String, String),
}

/// Everything a single `execute` call can override. Fields left
/// `None`/default fall back to the `ExecutionProfile` in force.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub prepare: bool,
    pub consistency: Option<Consistency>,
    pub serial_consistency: Option<Consistency>,
    pub fetch_size: Option<i32>,
    pub page_state: Option<Vec<u8>>,
    pub hints: Vec<Hint>,
    pub keyspace: Option<String>,
    pub routing_key: Option<Vec<u8>>,
    pub routing_indexes: Option<Vec<usize>>,
    pub is_idempotent: bool,
    pub read_timeout: Option<Duration>,
    pub retry_on_timeout: Option<bool>,
    pub execution_profile: Option<Arc<ExecutionProfile>>,
    pub trace_query: bool,
    pub timestamp: Option<i64>,
    /// Pin the request to this host, bypassing load balancing entirely.
    pub host: Option<SocketAddr>,
    pub custom_payload: Vec<(String, Vec<u8>)>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.is_idempotent = true;
        self
    }

    pub fn with_routing_key(mut self, key: Vec<u8>) -> Self {
        self.routing_key = Some(key);
        self
    }

    pub fn with_execution_profile(mut self, profile: Arc<ExecutionProfile>) -> Self {
        self.execution_profile = Some(profile);
        self
    }
}
