//! `Connection`: owns one transport, multiplexes concurrent requests
//! behind a per-Connection stream-id pool, and routes each parsed
//! response back to the waiter that sent it.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Framed};
use tracing::{instrument, warn};

use crate::auth::AuthProvider;
use crate::constant::{HeaderFlags, Opcode, ProtocolVersion};
use crate::error::{Error, Result};
use crate::protocol::frame::FrameHeader;
use crate::protocol::request;
use crate::protocol::response::ServerEvent;
use crate::protocol::{FrameDecoder, ResponseItem, StreamingParser};
use crate::socket::SocketFactory;

use super::buffer_pool::{FrameBufferPool, PooledBuffer};
use super::stream_id::StreamIdPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Ready,
    Defunct,
}

/// A registered in-flight request's response channel. `FrameEnded` is
/// always the last item forwarded before the waiter is torn down.
type Waiter = mpsc::UnboundedSender<ResponseItem>;

/// One socket to one `Host`, multiplexing concurrent requests by stream
/// id. Cheap to clone: all mutable state is behind `Arc`.
pub struct Connection {
    pub endpoint: SocketAddr,
    pub version: ProtocolVersion,
    state: Arc<RwLock<ConnectionState>>,
    stream_ids: Arc<StreamIdPool>,
    waiters: Arc<Mutex<HashMap<i16, Waiter>>>,
    /// Stream ids whose upcoming `RESULT` `Rows` frame should be decoded
    /// row-by-row rather than buffered whole. Drained into the reader
    /// task's `StreamingParser` on every loop iteration.
    row_by_row_wanted: Arc<Mutex<HashSet<i16>>>,
    event_tx: broadcast::Sender<ServerEvent>,
    write_tx: mpsc::UnboundedSender<PooledBuffer>,
    frame_pool: Arc<FrameBufferPool>,
    /// Epoch milliseconds of the last frame written or read; the
    /// heartbeat loop compares against this instead of holding a timer
    /// per idle tick.
    last_activity_ms: Arc<AtomicU64>,
    timeout_count: Arc<AtomicU32>,
    max_timeouts_before_defunct: u32,
    _reader_task: Arc<JoinHandle<()>>,
    _writer_task: Arc<JoinHandle<()>>,
    _heartbeat_task: Arc<JoinHandle<()>>,
}

/// What the coordinator needs to drive one request/response exchange: the
/// stream id it was allocated and the channel the Connection's reader task
/// will push `ResponseItem`s onto.
pub struct RequestHandle {
    pub stream_id: i16,
    pub rx: mpsc::UnboundedReceiver<ResponseItem>,
}

impl Connection {
    /// Connect, perform `STARTUP` (+ optional SASL auth loop), and start
    /// the reader/writer/heartbeat background tasks. Returns once the
    /// Connection has seen `READY` or `AUTH_SUCCESS` and is in state
    /// `Ready`.
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    pub async fn connect(
        endpoint: SocketAddr,
        version: ProtocolVersion,
        socket_factory: &(impl SocketFactory + ?Sized),
        auth: Option<&dyn AuthProvider>,
        stream_id_capacity: u16,
        band_release_after: Duration,
        heartbeat_interval: Duration,
        max_timeouts_before_defunct: u32,
        tcp_nodelay: bool,
    ) -> Result<Self> {
        let mut stream = socket_factory.connect(endpoint, tcp_nodelay).await?;
        let mut buf = BytesMut::with_capacity(4096);

        send_handshake_frame(&mut stream, version, Opcode::Startup, |out| {
            request::encode_startup(out, &[("CQL_VERSION".to_owned(), "3.0.0".to_owned())]);
        })
        .await?;

        loop {
            let (header, body) = read_one_frame(&mut stream, &mut buf).await?;
            match header.opcode {
                Opcode::Ready => break,
                Opcode::Authenticate => {
                    let provider = auth.ok_or_else(|| {
                        Error::AuthenticationError(
                            "server requires authentication but no AuthProvider was configured".to_owned(),
                        )
                    })?;
                    let token = provider.initial_response(endpoint)?;
                    send_handshake_frame(&mut stream, version, Opcode::AuthResponse, |out| {
                        request::encode_auth_response(out, &token);
                    })
                    .await?;
                    drive_auth_loop(&mut stream, &mut buf, version, provider).await?;
                    break;
                }
                Opcode::Error => {
                    let err = crate::protocol::response::read_server_error(&body)?;
                    return Err(Error::Server(err));
                }
                other => return Err(Error::protocol(format!("unexpected opcode {other:?} during STARTUP"))),
            }
        }

        let (read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel::<PooledBuffer>();
        let (event_tx, _event_rx) = broadcast::channel(256);
        let waiters: Arc<Mutex<HashMap<i16, Waiter>>> = Arc::new(Mutex::new(HashMap::new()));
        let row_by_row_wanted: Arc<Mutex<HashSet<i16>>> = Arc::new(Mutex::new(HashSet::new()));
        let stream_ids = Arc::new(StreamIdPool::new(stream_id_capacity, band_release_after));
        let state = Arc::new(RwLock::new(ConnectionState::Ready));
        let last_activity_ms = Arc::new(AtomicU64::new(now_ms()));
        let timeout_count = Arc::new(AtomicU32::new(0));
        let frame_pool = Arc::new(FrameBufferPool::default());

        let writer_task = tokio::spawn(writer_loop(write_half, write_rx, Arc::clone(&last_activity_ms)));
        let reader_task = tokio::spawn(reader_loop(
            read_half,
            Arc::clone(&waiters),
            Arc::clone(&stream_ids),
            Arc::clone(&row_by_row_wanted),
            event_tx.clone(),
            Arc::clone(&state),
            Arc::clone(&last_activity_ms),
        ));
        let heartbeat_task = tokio::spawn(heartbeat_loop(
            write_tx.clone(),
            Arc::clone(&last_activity_ms),
            Arc::clone(&state),
            Arc::clone(&stream_ids),
            Arc::clone(&waiters),
            Arc::clone(&frame_pool),
            heartbeat_interval,
            version,
        ));

        Ok(Self {
            endpoint,
            version,
            state,
            stream_ids,
            waiters,
            row_by_row_wanted,
            event_tx,
            write_tx,
            frame_pool,
            last_activity_ms,
            timeout_count,
            max_timeouts_before_defunct,
            _reader_task: Arc::new(reader_task),
            _writer_task: Arc::new(writer_task),
            _heartbeat_task: Arc::new(heartbeat_task),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    /// Number of stream ids currently in flight.
    pub fn in_flight(&self) -> usize {
        self.stream_ids.in_use()
    }

    pub fn release_stale_stream_id_bands(&self) {
        self.stream_ids.release_stale_bands();
    }

    /// Send a request body, allocating a stream id and registering a
    /// waiter for its response stream. Returns `Error::BusyConnection`
    /// without sending anything if no stream id is free.
    ///
    /// `trace` sets the `tracing` header flag so the server's response
    /// carries a trace id; `custom_payload`, when non-empty, is wire-encoded
    /// as a `[bytes map]` ahead of `body` with the `custom_payload` flag set,
    /// matching how both flags' extra bytes are ordered on the wire.
    #[instrument(skip_all, fields(endpoint = %self.endpoint, opcode = ?opcode))]
    pub fn send(
        &self,
        opcode: Opcode,
        body: &[u8],
        row_by_row: bool,
        trace: bool,
        custom_payload: &[(String, Vec<u8>)],
    ) -> Result<RequestHandle> {
        if !self.is_ready() {
            return Err(Error::ConnectionClosed);
        }
        let stream_id = self.stream_ids.borrow().ok_or(Error::BusyConnection)?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.waiters.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(stream_id, tx);
        if row_by_row {
            self.row_by_row_wanted.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(stream_id);
        }

        let mut flags = HeaderFlags::empty();
        if trace {
            flags |= HeaderFlags::TRACING;
        }
        if !custom_payload.is_empty() {
            flags |= HeaderFlags::CUSTOM_PAYLOAD;
        }

        let mut full_body = Vec::new();
        if !custom_payload.is_empty() {
            request::write_custom_payload(&mut full_body, custom_payload);
        }
        full_body.extend_from_slice(body);

        let header = FrameHeader {
            version: self.version,
            is_response: false,
            flags,
            stream_id,
            opcode,
            body_length: full_body.len() as u32,
        };
        let mut frame = self.frame_pool.take();
        header.encode(&mut frame);
        frame.extend_from_slice(&full_body);

        if self.write_tx.send(frame).is_err() {
            self.waiters.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&stream_id);
            self.stream_ids.release(stream_id);
            return Err(Error::ConnectionClosed);
        }

        Ok(RequestHandle { stream_id, rx })
    }

    /// Cancel an in-flight attempt: the response waiter is dropped so any
    /// late arrival is silently discarded by the reader task's
    /// best-effort `send`, but the stream id itself is *not* released
    /// here - only once `FrameEnded` for it actually arrives, or the
    /// Connection defuncts.
    pub fn cancel(&self, stream_id: i16) {
        self.waiters.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&stream_id);
    }

    /// Record that an attempt on this Connection missed its per-operation
    /// read timeout; past `max_timeouts_before_defunct` such events the
    /// Connection is marked `Defunct`.
    pub fn record_timeout(&self) {
        let count = self.timeout_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= self.max_timeouts_before_defunct {
            self.mark_defunct();
        }
    }

    pub fn mark_defunct(&self) {
        *self.state.write().unwrap_or_else(std::sync::PoisonError::into_inner) = ConnectionState::Defunct;
        self.waiters.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

async fn send_handshake_frame(
    stream: &mut TcpStream,
    version: ProtocolVersion,
    opcode: Opcode,
    encode_body: impl FnOnce(&mut Vec<u8>),
) -> Result<()> {
    let mut body = Vec::new();
    encode_body(&mut body);
    let header = FrameHeader {
        version,
        is_response: false,
        flags: HeaderFlags::empty(),
        stream_id: 0,
        opcode,
        body_length: body.len() as u32,
    };
    let mut frame = Vec::with_capacity(version.header_len() + body.len());
    header.encode(&mut frame);
    frame.extend_from_slice(&body);
    stream.write_all(&frame).await?;
    Ok(())
}

async fn read_one_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<(FrameHeader, BytesMut)> {
    let mut decoder = FrameDecoder::default();
    loop {
        if let Some(item) = decoder.decode(buf)? {
            return Ok(item);
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn drive_auth_loop(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    version: ProtocolVersion,
    provider: &dyn AuthProvider,
) -> Result<()> {
    loop {
        let (header, body) = read_one_frame(stream, buf).await?;
        match header.opcode {
            Opcode::AuthSuccess => return Ok(()),
            Opcode::AuthChallenge => {
                let challenge = crate::protocol::response::read_auth_token(&body)?.unwrap_or_default();
                let token = provider.evaluate_challenge(&challenge)?;
                send_handshake_frame(stream, version, Opcode::AuthResponse, |out| {
                    request::encode_auth_response(out, &token);
                })
                .await?;
            }
            Opcode::Error => {
                let err = crate::protocol::response::read_server_error(&body)?;
                return Err(Error::AuthenticationError(err.message));
            }
            other => return Err(Error::protocol(format!("unexpected opcode {other:?} during auth"))),
        }
    }
}

async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<PooledBuffer>,
    last_activity_ms: Arc<AtomicU64>,
) {
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(frame.as_slice()).await.is_err() {
            return;
        }
        last_activity_ms.store(now_ms(), Ordering::Relaxed);
        // `frame` drops here, clearing and returning its buffer to the pool.
    }
}

#[instrument(skip_all)]
async fn reader_loop(
    read_half: OwnedReadHalf,
    waiters: Arc<Mutex<HashMap<i16, Waiter>>>,
    stream_ids: Arc<StreamIdPool>,
    row_by_row_wanted: Arc<Mutex<HashSet<i16>>>,
    event_tx: broadcast::Sender<ServerEvent>,
    state: Arc<RwLock<ConnectionState>>,
    last_activity_ms: Arc<AtomicU64>,
) {
    let mut framed = Framed::new(read_half, StreamingParser::new());
    loop {
        {
            let mut wanted = row_by_row_wanted.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for stream_id in wanted.drain() {
                framed.decoder_mut().expect_row_by_row(stream_id);
            }
        }

        match framed.next().await {
            Some(Ok(item)) => {
                last_activity_ms.store(now_ms(), Ordering::Relaxed);
                let stream_id = item.stream_id();
                if stream_id < 0 {
                    if let ResponseItem::Event { event, .. } = item {
                        let _ = event_tx.send(event);
                    }
                    continue;
                }
                let is_end = matches!(item, ResponseItem::FrameEnded { .. });
                {
                    let waiters = waiters.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    if let Some(tx) = waiters.get(&stream_id) {
                        let _ = tx.send(item);
                    }
                }
                if is_end {
                    waiters.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&stream_id);
                    stream_ids.release(stream_id);
                }
            }
            Some(Err(err)) => {
                warn!(%err, "connection read error, marking defunct");
                break;
            }
            None => break,
        }
    }
    *state.write().unwrap_or_else(std::sync::PoisonError::into_inner) = ConnectionState::Defunct;
    waiters.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
}

/// Sends `OPTIONS` on an idle Connection and expects `SUPPORTED` back.
/// The probe borrows a real stream id from the
/// pool rather than hardcoding one - stream id 0 may well be in use by a
/// concurrent request, and routing its `SUPPORTED` reply into that
/// request's waiter would corrupt the response stream.
async fn heartbeat_loop(
    write_tx: mpsc::UnboundedSender<PooledBuffer>,
    last_activity_ms: Arc<AtomicU64>,
    state: Arc<RwLock<ConnectionState>>,
    stream_ids: Arc<StreamIdPool>,
    waiters: Arc<Mutex<HashMap<i16, Waiter>>>,
    frame_pool: Arc<FrameBufferPool>,
    interval: Duration,
    version: ProtocolVersion,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if *state.read().unwrap_or_else(std::sync::PoisonError::into_inner) != ConnectionState::Ready {
            return;
        }
        let idle_for = now_ms().saturating_sub(last_activity_ms.load(Ordering::Relaxed));
        if idle_for < interval.as_millis() as u64 {
            continue;
        }

        let Some(stream_id) = stream_ids.borrow() else {
            // At capacity: skip this tick rather than block a slot the
            // coordinator needs for real requests.
            continue;
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        waiters.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(stream_id, tx);

        let header = FrameHeader {
            version,
            is_response: false,
            flags: HeaderFlags::empty(),
            stream_id,
            opcode: Opcode::Options,
            body_length: 0,
        };
        let mut frame = frame_pool.take();
        header.encode(&mut frame);
        if write_tx.send(frame).is_err() {
            return;
        }

        match tokio::time::timeout(interval, rx.recv()).await {
            Ok(Some(ResponseItem::Supported { .. })) => {}
            _ => {
                warn!("heartbeat OPTIONS/SUPPORTED failed, marking connection defunct");
                *state.write().unwrap_or_else(std::sync::PoisonError::into_inner) = ConnectionState::Defunct;
                waiters.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clear();
                return;
            }
        }
    }
}
