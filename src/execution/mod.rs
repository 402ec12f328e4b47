//! Drives one user request across a query plan: host selection, retry,
//! per-attempt timeout and speculative parallel attempts, consulting the
//! [`crate::policy`] plane at each decision point.

pub mod coordinator;
pub mod request;

pub use coordinator::{ExecutionOutcome, ExecutionResult, RequestCoordinator, Statement};
pub use request::{ExecutionProfile, Hint, RequestOptions};
