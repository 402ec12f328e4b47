//! `SocketFactory`: an external collaborator producing a transport for a
//! `Connection` to drive. TLS configuration and DNS resolution policy are
//! kept out of this crate's core; this trait is the seam where a caller
//! plugs them in.

use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::error::Result;

/// Yields a connected transport for an endpoint. The default impl is a
/// plain `TcpStream` with `TCP_NODELAY` set; a TLS-terminating factory
/// wraps the same socket and is handed to `Connection` the same way.
pub trait SocketFactory: Send + Sync {
    fn connect(&self, endpoint: SocketAddr, tcp_nodelay: bool) -> impl std::future::Future<Output = Result<TcpStream>> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpSocketFactory;

impl SocketFactory for TcpSocketFactory {
    async fn connect(&self, endpoint: SocketAddr, tcp_nodelay: bool) -> Result<TcpStream> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(tcp_nodelay)?;
        Ok(stream)
    }
}
