//! `RequestCoordinator`: drives one user request to completion across a
//! query plan, consulting the retry and speculative execution policies
//! at each decision point.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio::sync::oneshot;

use crate::constant::{Consistency, ErrorCode, Opcode};
use crate::error::{Error, Result};
use crate::host::{Host, RoutingInfo};
use crate::net::connection::{Connection, RequestHandle};
use crate::policy::load_balancing::QueryPlan;
use crate::policy::retry::RetryDecision;
use crate::protocol::request::{self, BatchEntry, BatchType, QueryParameters};
use crate::protocol::response::{ErrorDetail, PreparedResult, Row, SchemaChange, ServerError};
use crate::protocol::row::RowsMetadata;
use crate::protocol::ResponseItem;

use super::request::{ExecutionProfile, RequestOptions};

/// What a caller sends: either a plain query string or a previously
/// prepared statement id, along with the query text that produced it (so
/// an `Unprepared` error can trigger a transparent re-`PREPARE`).
#[derive(Clone)]
pub enum Statement {
    Query(String),
    Prepared { query_id: Vec<u8>, query_text: Arc<str> },
    /// A `BATCH` of queries and/or prepared statements, each with its own
    /// bound values; not idempotent-safe to re-`PREPARE` transparently, so
    /// `Unprepared` on a batch entry rethrows rather than re-preparing (no
    /// single `query_text` to reissue against).
    Batch { batch_type: BatchType, entries: Arc<[BatchEntry]> },
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query(q) => f.debug_tuple("Query").field(q).finish(),
            Self::Prepared { query_id, query_text } => {
                f.debug_struct("Prepared").field("query_id", query_id).field("query_text", query_text).finish()
            }
            Self::Batch { batch_type, entries } => {
                f.debug_struct("Batch").field("batch_type", batch_type).field("entries", &entries.len()).finish()
            }
        }
    }
}

/// The decoded payload of a successful request, tagged by `RESULT` kind.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Void,
    Rows { metadata: RowsMetadata, rows: Vec<Row> },
    SetKeyspace(String),
    Prepared(PreparedResult),
    SchemaChange(SchemaChange),
}

/// Counters surfaced alongside a successful result, for callers that
/// want to observe retry/speculation behavior without extra wiring.
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub queried_host: Option<SocketAddr>,
    pub speculative_executions: u32,
    pub tried_hosts: HashMap<Host, Box<Error>>,
    pub achieved_consistency: Consistency,
    pub warnings: Vec<String>,
    pub trace_id: Option<[u8; 16]>,
}

/// Drives requests against a default `ExecutionProfile`; a per-request
/// `RequestOptions::execution_profile` overrides it for that one call.
pub struct RequestCoordinator {
    default_profile: Arc<ExecutionProfile>,
}

impl RequestCoordinator {
    pub fn new(default_profile: Arc<ExecutionProfile>) -> Self {
        Self { default_profile }
    }

    fn profile<'a>(&'a self, options: &'a RequestOptions) -> &'a ExecutionProfile {
        options.execution_profile.as_deref().unwrap_or(&self.default_profile)
    }

    /// The core state machine driving one request: `Start → Attempt(k) →
    /// (Success | RetryOnSameHost | AdvancePlan | Cancelled)`.
    pub async fn execute(
        &self,
        statement: &Statement,
        values: Vec<(Option<String>, Option<Vec<u8>>)>,
        options: &RequestOptions,
    ) -> Result<ExecutionResult> {
        let profile = self.profile(options);
        let routing = RoutingInfo {
            keyspace: options.keyspace.clone().map(Into::into),
            routing_key: options.routing_key.clone(),
        };

        let mut plan: QueryPlan = profile.load_balancing_policy.new_query_plan(options.keyspace.as_deref(), &routing);
        if let Some(pinned) = options.host {
            plan = Box::new(plan.filter(move |h| h.address == pinned));
        }

        let mut spec_plan =
            options.is_idempotent.then(|| profile.speculative_execution_policy.new_plan(options.keyspace.as_deref(), &routing));

        let mut tried_hosts: HashMap<Host, Box<Error>> = HashMap::new();
        let mut cancels: HashMap<u64, oneshot::Sender<()>> = HashMap::new();
        let mut next_attempt_id: u64 = 0;
        let mut speculative_executions: u32 = 0;

        let consistency = options.consistency.unwrap_or(profile.consistency);
        let params = QueryParameters {
            consistency,
            values,
            skip_metadata: false,
            page_size: options.fetch_size,
            paging_state: options.page_state.clone(),
            serial_consistency: options.serial_consistency.or(profile.serial_consistency),
            timestamp: options.timestamp,
        };

        type Attempt<'a> = Pin<Box<dyn Future<Output = (u64, Host, ChainOutcome)> + Send + 'a>>;
        let mut in_flight: FuturesUnordered<Attempt<'_>> = FuturesUnordered::new();

        let Some(first_host) = next_launchable_host(&mut plan, &mut tried_hosts) else {
            return Err(Error::NoHostAvailable { inner_errors: tried_hosts });
        };
        spawn_attempt(first_host, statement, &params, profile, options, &mut in_flight, &mut cancels, &mut next_attempt_id);

        let mut spec_timer = next_spec_delay(&mut spec_plan).map(|ms| Box::pin(tokio::time::sleep(Duration::from_millis(ms))));

        loop {
            tokio::select! {
                biased;

                Some((id, host, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                    cancels.remove(&id);
                    match outcome {
                        ChainOutcome::Success { outcome, warnings, tracing_id } => {
                            for (_, cancel) in cancels.drain() {
                                let _ = cancel.send(());
                            }
                            return Ok(ExecutionResult {
                                outcome,
                                queried_host: Some(host.address),
                                speculative_executions,
                                tried_hosts,
                                achieved_consistency: params.consistency,
                                warnings,
                                trace_id: tracing_id,
                            });
                        }
                        ChainOutcome::Rethrow(err) => {
                            for (_, cancel) in cancels.drain() {
                                let _ = cancel.send(());
                            }
                            return Err(err);
                        }
                        ChainOutcome::AdvanceToNextHost(err) => {
                            tried_hosts.insert(host, Box::new(err));
                            if let Some(next_host) = next_launchable_host(&mut plan, &mut tried_hosts) {
                                spawn_attempt(next_host, statement, &params, profile, options, &mut in_flight, &mut cancels, &mut next_attempt_id);
                            } else if in_flight.is_empty() {
                                return Err(Error::NoHostAvailable { inner_errors: tried_hosts });
                            }
                            // else: leave it to the last attempt still in flight -
                            // a speculative execution is running elsewhere.
                        }
                        ChainOutcome::Cancelled => {}
                    }
                }

                () = maybe_sleep(&mut spec_timer) => {
                    spec_timer = None;
                    if let Some(next_host) = next_launchable_host(&mut plan, &mut tried_hosts) {
                        speculative_executions += 1;
                        spawn_attempt(next_host, statement, &params, profile, options, &mut in_flight, &mut cancels, &mut next_attempt_id);
                        spec_timer = next_spec_delay(&mut spec_plan).map(|ms| Box::pin(tokio::time::sleep(Duration::from_millis(ms))));
                    }
                }

                else => {
                    return Err(Error::NoHostAvailable { inner_errors: tried_hosts });
                }
            }
        }
    }
}

fn next_spec_delay(spec_plan: &mut Option<Box<dyn crate::policy::speculative::SpeculativeExecutionPlan>>) -> Option<u64> {
    spec_plan.as_mut().and_then(|p| p.next_execution())
}

async fn maybe_sleep(timer: &mut Option<Pin<Box<tokio::time::Sleep>>>) {
    match timer {
        Some(t) => t.await,
        None => std::future::pending::<()>().await,
    }
}

/// Advance `plan` until a host whose pool can hand out a Connection is
/// found, recording every miss against `tried_hosts` along the way.
fn next_launchable_host(plan: &mut QueryPlan, tried_hosts: &mut HashMap<Host, Box<Error>>) -> Option<Host> {
    for host in plan.by_ref() {
        if host.pool.borrow().is_ok() {
            return Some(host);
        }
        tried_hosts.insert(host, Box::new(Error::BusyConnection));
    }
    None
}

enum ChainOutcome {
    Success { outcome: ExecutionOutcome, warnings: Vec<String>, tracing_id: Option<[u8; 16]> },
    /// Terminal for the whole request - no other host will be tried.
    Rethrow(Error),
    /// This host's attempt failed in a way the query plan should advance
    /// past; not counted as a speculative execution.
    AdvanceToNextHost(Error),
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
fn spawn_attempt<'a>(
    host: Host,
    statement: &'a Statement,
    params: &'a QueryParameters,
    profile: &'a ExecutionProfile,
    options: &'a RequestOptions,
    in_flight: &mut FuturesUnordered<Pin<Box<dyn Future<Output = (u64, Host, ChainOutcome)> + Send + 'a>>>,
    cancels: &mut HashMap<u64, oneshot::Sender<()>>,
    next_id: &mut u64,
) {
    let id = *next_id;
    *next_id += 1;
    let (cancel_tx, cancel_rx) = oneshot::channel();
    cancels.insert(id, cancel_tx);
    let host_for_fut = host;
    let fut = async move {
        let outcome = run_attempt_chain(host_for_fut.clone(), statement, params, profile, options, cancel_rx).await;
        (id, host_for_fut, outcome)
    };
    in_flight.push(Box::pin(fut));
}

/// One host's attempt, including any same-host retries the Retry Policy
/// grants and any transparent re-`PREPARE` triggered by `Unprepared`.
///
/// `options.prepare` additionally resolves a plain `Statement::Query` to a
/// prepared statement on this Host before the first `EXECUTE`, coalescing
/// concurrent preparers of the same text via the Host Pool's prepare cache.
async fn run_attempt_chain(
    host: Host,
    statement: &Statement,
    params: &QueryParameters,
    profile: &ExecutionProfile,
    options: &RequestOptions,
    mut cancel_rx: oneshot::Receiver<()>,
) -> ChainOutcome {
    let read_timeout = options.read_timeout.or(profile.read_timeout);

    if options.prepare {
        if let Statement::Query(text) = statement {
            let connection = match host.pool.borrow() {
                Ok(c) => c,
                Err(err) => return ChainOutcome::AdvanceToNextHost(err),
            };
            let prepared = match prepare_via_cache(&host, &connection, text, read_timeout, &mut cancel_rx).await {
                Ok(prepared) => prepared,
                Err(err) => return ChainOutcome::AdvanceToNextHost(err),
            };
            let resolved = Statement::Prepared { query_id: prepared.query_id, query_text: Arc::from(text.as_str()) };
            return execute_loop(host, &resolved, params, profile, options, cancel_rx).await;
        }
    }

    execute_loop(host, statement, params, profile, options, cancel_rx).await
}

/// Coalesce concurrent `PREPARE`s for `query_text` on `host` to one network
/// round trip via the Host Pool's per-query `OnceCell`; a failed attempt
/// leaves the cell empty so the next caller retries rather than wedging.
async fn prepare_via_cache(
    host: &Host,
    connection: &Connection,
    query_text: &str,
    read_timeout: Option<Duration>,
    cancel_rx: &mut oneshot::Receiver<()>,
) -> Result<PreparedResult> {
    let cell = host.pool.prepare_cache_entry(query_text);
    cell.get_or_try_init(|| async { prepare_on_connection(connection, query_text, read_timeout, cancel_rx).await })
        .await
        .map(Clone::clone)
}

async fn execute_loop(
    host: Host,
    statement: &Statement,
    params: &QueryParameters,
    profile: &ExecutionProfile,
    options: &RequestOptions,
    mut cancel_rx: oneshot::Receiver<()>,
) -> ChainOutcome {
    let mut params = params.clone();
    let read_timeout = options.read_timeout.or(profile.read_timeout);
    let retry_on_timeout = options.retry_on_timeout.unwrap_or(profile.retry_on_timeout);
    let mut nb_retry: u32 = 0;

    loop {
        let connection = match host.pool.borrow() {
            Ok(c) => c,
            Err(err) => return ChainOutcome::AdvanceToNextHost(err),
        };

        let (opcode, body) = encode_statement(statement, &params);
        let handle = match connection.send(opcode, &body, false, options.trace_query, &options.custom_payload) {
            Ok(h) => h,
            Err(err) => return ChainOutcome::AdvanceToNextHost(err),
        };

        match single_roundtrip(&connection, handle, read_timeout, &mut cancel_rx).await {
            RoundtripOutcome::Item(ResponseItem::Void { tracing_id, warnings, .. }) => {
                return ChainOutcome::Success { outcome: ExecutionOutcome::Void, warnings, tracing_id };
            }
            RoundtripOutcome::Item(ResponseItem::SetKeyspace { keyspace, .. }) => {
                return ChainOutcome::Success {
                    outcome: ExecutionOutcome::SetKeyspace(keyspace),
                    warnings: Vec::new(),
                    tracing_id: None,
                };
            }
            RoundtripOutcome::Item(ResponseItem::Prepared { result, .. }) => {
                return ChainOutcome::Success {
                    outcome: ExecutionOutcome::Prepared(result),
                    warnings: Vec::new(),
                    tracing_id: None,
                };
            }
            RoundtripOutcome::Item(ResponseItem::SchemaChange { change, .. }) => {
                return ChainOutcome::Success {
                    outcome: ExecutionOutcome::SchemaChange(change),
                    warnings: Vec::new(),
                    tracing_id: None,
                };
            }
            RoundtripOutcome::Item(ResponseItem::Rows { metadata, rows, tracing_id, warnings, .. }) => {
                return ChainOutcome::Success { outcome: ExecutionOutcome::Rows { metadata, rows }, warnings, tracing_id };
            }
            RoundtripOutcome::Item(ResponseItem::Error { error, .. }) => {
                match handle_server_error(error, &mut params, profile, statement, &connection, read_timeout, &mut cancel_rx, nb_retry).await
                {
                    ServerErrorOutcome::RetrySameHost => {
                        nb_retry += 1;
                        continue;
                    }
                    ServerErrorOutcome::Reexecute => continue,
                    ServerErrorOutcome::AdvanceToNextHost(err) => return ChainOutcome::AdvanceToNextHost(err),
                    ServerErrorOutcome::Rethrow(err) => return ChainOutcome::Rethrow(err),
                    ServerErrorOutcome::Ignore => {
                        return ChainOutcome::Success { outcome: ExecutionOutcome::Void, warnings: Vec::new(), tracing_id: None };
                    }
                }
            }
            RoundtripOutcome::Item(_) => {
                return ChainOutcome::Rethrow(Error::protocol("unexpected response item for a request frame"));
            }
            RoundtripOutcome::Transport(err) => {
                if !options.is_idempotent {
                    return ChainOutcome::Rethrow(err);
                }
                match profile.retry_policy.on_request_error(&err, nb_retry) {
                    RetryDecision::Retry(cl) => {
                        if let Some(cl) = cl {
                            params.consistency = cl;
                        }
                        nb_retry += 1;
                        continue;
                    }
                    RetryDecision::RetryNextHost(cl) => {
                        if let Some(cl) = cl {
                            params.consistency = cl;
                        }
                        return ChainOutcome::AdvanceToNextHost(err);
                    }
                    RetryDecision::Ignore => {
                        return ChainOutcome::Success { outcome: ExecutionOutcome::Void, warnings: Vec::new(), tracing_id: None };
                    }
                    RetryDecision::Rethrow => return ChainOutcome::Rethrow(err),
                }
            }
            RoundtripOutcome::Timeout => {
                connection.record_timeout();
                let err = Error::OperationTimedOut {
                    stream_id: -1,
                    endpoint: host.address,
                    elapsed_ms: read_timeout.map(|d| d.as_millis() as u64).unwrap_or(0),
                };
                if retry_on_timeout {
                    return ChainOutcome::AdvanceToNextHost(err);
                }
                return ChainOutcome::Rethrow(err);
            }
            RoundtripOutcome::Cancelled => return ChainOutcome::Cancelled,
        }
    }
}

enum ServerErrorOutcome {
    RetrySameHost,
    /// The `Unprepared` re-`PREPARE` succeeded; re-send the same statement.
    Reexecute,
    AdvanceToNextHost(Error),
    Rethrow(Error),
    Ignore,
}

#[allow(clippy::too_many_arguments)]
async fn handle_server_error(
    error: ServerError,
    params: &mut QueryParameters,
    profile: &ExecutionProfile,
    statement: &Statement,
    connection: &Connection,
    read_timeout: Option<Duration>,
    cancel_rx: &mut oneshot::Receiver<()>,
    nb_retry: u32,
) -> ServerErrorOutcome {
    let code = error.code;
    let original = Error::Server(error.clone());
    match (code, error.detail) {
        (ErrorCode::Unavailable, ErrorDetail::Unavailable { consistency, required, alive }) => {
            apply_decision(profile.retry_policy.on_unavailable(consistency, required, alive, nb_retry), params, original)
        }
        (ErrorCode::ReadTimeout, ErrorDetail::ReadTimeout { consistency, received, block_for, data_present }) => apply_decision(
            profile.retry_policy.on_read_timeout(consistency, received, block_for, data_present, nb_retry),
            params,
            original,
        ),
        (ErrorCode::WriteTimeout, ErrorDetail::WriteTimeout { consistency, received, block_for, write_type }) => {
            let decision = profile.retry_policy.on_write_timeout(consistency, received, block_for, &write_type, nb_retry);
            apply_decision(decision, params, original)
        }
        (ErrorCode::Overloaded | ErrorCode::IsBootstrapping | ErrorCode::TruncateError, _) => {
            ServerErrorOutcome::AdvanceToNextHost(original)
        }
        (ErrorCode::Unprepared, _) => {
            let Statement::Prepared { query_text, .. } = statement else {
                return ServerErrorOutcome::Rethrow(original);
            };
            match reprepare_on_connection(connection, query_text, read_timeout, cancel_rx).await {
                Ok(()) => ServerErrorOutcome::Reexecute,
                Err(err) => ServerErrorOutcome::AdvanceToNextHost(err),
            }
        }
        _ => ServerErrorOutcome::Rethrow(original),
    }
}

fn apply_decision(decision: RetryDecision, params: &mut QueryParameters, original: Error) -> ServerErrorOutcome {
    match decision {
        RetryDecision::Retry(cl) => {
            if let Some(cl) = cl {
                params.consistency = cl;
            }
            ServerErrorOutcome::RetrySameHost
        }
        RetryDecision::RetryNextHost(cl) => {
            if let Some(cl) = cl {
                params.consistency = cl;
            }
            ServerErrorOutcome::AdvanceToNextHost(original)
        }
        RetryDecision::Rethrow => ServerErrorOutcome::Rethrow(original),
        RetryDecision::Ignore => ServerErrorOutcome::Ignore,
    }
}

fn encode_statement(statement: &Statement, params: &QueryParameters) -> (Opcode, Vec<u8>) {
    let mut body = Vec::new();
    match statement {
        Statement::Query(text) => {
            request::encode_query(&mut body, text, params);
            (Opcode::Query, body)
        }
        Statement::Prepared { query_id, .. } => {
            request::encode_execute(&mut body, query_id, params);
            (Opcode::Execute, body)
        }
        Statement::Batch { batch_type, entries } => {
            request::encode_batch(
                &mut body,
                *batch_type,
                entries,
                params.consistency,
                params.serial_consistency,
                params.timestamp,
            );
            (Opcode::Batch, body)
        }
    }
}

async fn reprepare_on_connection(
    connection: &Connection,
    query_text: &str,
    read_timeout: Option<Duration>,
    cancel_rx: &mut oneshot::Receiver<()>,
) -> Result<()> {
    prepare_on_connection(connection, query_text, read_timeout, cancel_rx).await.map(|_| ())
}

/// Send a `PREPARE` for `query_text` on `connection` and await its result.
async fn prepare_on_connection(
    connection: &Connection,
    query_text: &str,
    read_timeout: Option<Duration>,
    cancel_rx: &mut oneshot::Receiver<()>,
) -> Result<PreparedResult> {
    let mut body = Vec::new();
    request::encode_prepare(&mut body, query_text);
    let handle = connection.send(Opcode::Prepare, &body, false, false, &[])?;
    match single_roundtrip(connection, handle, read_timeout, cancel_rx).await {
        RoundtripOutcome::Item(ResponseItem::Prepared { result, .. }) => Ok(result),
        RoundtripOutcome::Item(ResponseItem::Error { error, .. }) => Err(Error::Server(error)),
        RoundtripOutcome::Item(_) => Err(Error::protocol("unexpected response to PREPARE")),
        RoundtripOutcome::Transport(err) => Err(err),
        RoundtripOutcome::Timeout => {
            Err(Error::OperationTimedOut { stream_id: -1, endpoint: connection.endpoint, elapsed_ms: 0 })
        }
        RoundtripOutcome::Cancelled => Err(Error::ConnectionClosed),
    }
}

enum RoundtripOutcome {
    Item(ResponseItem),
    Transport(Error),
    Timeout,
    Cancelled,
}

/// Send-and-await one request/response exchange, racing the per-attempt
/// read timeout and the coordinator's cancellation signal.
async fn single_roundtrip(
    connection: &Connection,
    handle: RequestHandle,
    read_timeout: Option<Duration>,
    cancel_rx: &mut oneshot::Receiver<()>,
) -> RoundtripOutcome {
    let RequestHandle { stream_id, mut rx } = handle;

    tokio::select! {
        biased;
        _ = &mut *cancel_rx => {
            connection.cancel(stream_id);
            RoundtripOutcome::Cancelled
        }
        item = rx.recv() => match item {
            Some(ResponseItem::FrameEnded { .. }) => RoundtripOutcome::Transport(Error::protocol("frame ended before any result item")),
            Some(other) => RoundtripOutcome::Item(other),
            None => RoundtripOutcome::Transport(Error::ConnectionClosed),
        },
        () = sleep_or_pending(read_timeout) => {
            connection.cancel(stream_id);
            RoundtripOutcome::Timeout
        }
    }
}

async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(d) if !d.is_zero() => tokio::time::sleep(d).await,
        _ => std::future::pending::<()>().await,
    }
}
