//! Transport-owning layer: `Connection` multiplexes one socket by stream
//! id; `HostPool` owns a Host's set of Connections.

pub mod buffer_pool;
pub mod connection;
pub mod pool;
pub mod stream_id;

pub use buffer_pool::FrameBufferPool;
pub use connection::{Connection, ConnectionState, RequestHandle};
pub use pool::HostPool;
