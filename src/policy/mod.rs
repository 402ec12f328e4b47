//! The policy plane: pluggable strategies the execution coordinator
//! consults at each decision point - which host to try next, whether to
//! retry a failed attempt, whether to fire a speculative attempt in
//! parallel, and how fast to retry a Defunct connection.

pub mod load_balancing;
pub mod reconnection;
pub mod retry;
pub mod speculative;

pub use load_balancing::{LoadBalancingPolicy, QueryPlan};
pub use reconnection::ReconnectionPolicy;
pub use retry::{RetryDecision, RetryPolicy};
pub use speculative::{SpeculativeExecutionPlan, SpeculativeExecutionPolicy};
