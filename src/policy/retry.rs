//! `RetryPolicy`: given a server-reported error and how many times this
//! attempt has already been retried, decides whether/how to retry.

use crate::constant::{Consistency, WriteType};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry on the same host, optionally at a different consistency.
    Retry(Option<Consistency>),
    /// Retry on the next host in the query plan, optionally at a
    /// different consistency.
    RetryNextHost(Option<Consistency>),
    /// Surface the error to the caller; no further attempts.
    Rethrow,
    /// Treat the failed operation as an empty success - a read timeout
    /// with partial data already reaching quorum is the usual case a
    /// concrete policy applies this to.
    Ignore,
}

pub trait RetryPolicy: Send + Sync {
    fn on_read_timeout(
        &self,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
        retry_count: u32,
    ) -> RetryDecision;

    fn on_write_timeout(
        &self,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        write_type: &WriteType,
        retry_count: u32,
    ) -> RetryDecision;

    fn on_unavailable(&self, consistency: Consistency, required: i32, alive: i32, retry_count: u32) -> RetryDecision;

    /// A transport-level failure (not a server `ERROR` frame at all).
    fn on_request_error(&self, error: &Error, retry_count: u32) -> RetryDecision;
}

/// The conservative default: retry once on the same host when enough
/// replicas replied to plausibly have succeeded, retry once more replicas
/// are needed by moving to the next host, and never retry anything that
/// isn't obviously transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn on_read_timeout(
        &self,
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
        retry_count: u32,
    ) -> RetryDecision {
        if retry_count > 0 {
            return RetryDecision::Rethrow;
        }
        if received >= block_for && !data_present {
            RetryDecision::Retry(Some(consistency))
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_write_timeout(
        &self,
        consistency: Consistency,
        _received: i32,
        _block_for: i32,
        write_type: &WriteType,
        retry_count: u32,
    ) -> RetryDecision {
        if retry_count > 0 {
            return RetryDecision::Rethrow;
        }
        match write_type {
            WriteType::BatchLog => RetryDecision::Retry(Some(consistency)),
            _ => RetryDecision::Rethrow,
        }
    }

    fn on_unavailable(&self, consistency: Consistency, _required: i32, _alive: i32, retry_count: u32) -> RetryDecision {
        if retry_count == 0 {
            RetryDecision::RetryNextHost(Some(consistency))
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_request_error(&self, error: &Error, retry_count: u32) -> RetryDecision {
        if retry_count > 0 {
            return RetryDecision::Rethrow;
        }
        if error.is_retryable_on_next_host() {
            RetryDecision::RetryNextHost(None)
        } else {
            RetryDecision::Rethrow
        }
    }
}

/// Never retries anything - useful for a fail-fast execution profile or
/// for exercising "how many times did we actually try" counters in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn on_read_timeout(&self, _: Consistency, _: i32, _: i32, _: bool, _: u32) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_write_timeout(&self, _: Consistency, _: i32, _: i32, _: &WriteType, _: u32) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_unavailable(&self, _: Consistency, _: i32, _: i32, _: u32) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_request_error(&self, _: &Error, _: u32) -> RetryDecision {
        RetryDecision::Rethrow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_retries_read_timeout_once_when_plausibly_successful() {
        let policy = DefaultRetryPolicy;
        assert_eq!(
            policy.on_read_timeout(Consistency::Quorum, 2, 2, false, 0),
            RetryDecision::Retry(Some(Consistency::Quorum))
        );
        assert_eq!(policy.on_read_timeout(Consistency::Quorum, 2, 2, false, 1), RetryDecision::Rethrow);
    }

    #[test]
    fn default_policy_moves_to_next_host_on_first_unavailable() {
        let policy = DefaultRetryPolicy;
        assert_eq!(
            policy.on_unavailable(Consistency::Quorum, 2, 1, 0),
            RetryDecision::RetryNextHost(Some(Consistency::Quorum))
        );
        assert_eq!(policy.on_unavailable(Consistency::Quorum, 2, 1, 1), RetryDecision::Rethrow);
    }

    #[test]
    fn fallthrough_never_retries() {
        let policy = FallthroughRetryPolicy;
        assert_eq!(policy.on_unavailable(Consistency::One, 1, 1, 0), RetryDecision::Rethrow);
    }
}
