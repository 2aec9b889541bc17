//! One-shot transfer acceptor.
//!
//! Each Upload or Download opens its own listener, reports the bound
//! port back through the RPC reply, waits for exactly one peer, and
//! closes. A listener that nobody connects to within the accept window
//! releases its port and reports a timeout.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::debug;

use dutr_common::AgentError;

#[derive(Debug)]
pub struct TransferListener {
    listener: TcpListener,
    port: u16,
}

impl TransferListener {
    /// Bind on `bind_address`. Port 0 asks the OS for an ephemeral port.
    ///
    /// `SO_REUSEADDR` is applied only for caller-assigned (nonzero)
    /// ports, mirroring the control surface this agent replaces; a bind
    /// collision on such a port surfaces as `TransferProtocol`.
    pub fn bind(bind_address: &str, requested_port: u16, reuse: bool) -> Result<Self, AgentError> {
        let addr: SocketAddr = format!("{bind_address}:{requested_port}")
            .parse()
            .map_err(|_| {
                AgentError::TransferProtocol(format!("invalid bind address {bind_address}"))
            })?;

        let socket = if addr.is_ipv6() {
            TcpSocket::new_v6()
        } else {
            TcpSocket::new_v4()
        }
        .map_err(AgentError::Io)?;

        if requested_port != 0 && reuse {
            socket.set_reuseaddr(true).map_err(AgentError::Io)?;
        }
        socket.bind(addr).map_err(|err| {
            AgentError::TransferProtocol(format!("bind to port {requested_port} failed: {err}"))
        })?;
        let listener = socket.listen(1).map_err(AgentError::Io)?;
        let port = listener.local_addr().map_err(AgentError::Io)?.port();
        debug!(port, "transfer listener bound");
        Ok(Self { listener, port })
    }

    /// The port a client must connect to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the single peer. Consumes the listener either way, so
    /// the port is released the moment this returns.
    pub async fn accept_one(self, timeout: Duration) -> Result<TcpStream, AgentError> {
        match tokio::time::timeout(timeout, self.listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!(port = self.port, %peer, "transfer peer connected");
                Ok(stream)
            }
            Ok(Err(err)) => Err(AgentError::Io(err)),
            Err(_) => Err(AgentError::TransferTimeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn os_assigned_port_is_nonzero() {
        let listener = TransferListener::bind("127.0.0.1", 0, false).unwrap();
        assert_ne!(listener.port(), 0);
    }

    #[tokio::test]
    async fn accepts_exactly_one_peer() {
        let listener = TransferListener::bind("127.0.0.1", 0, false).unwrap();
        let port = listener.port();

        let client = tokio::spawn(async move {
            TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        });

        let stream = listener.accept_one(Duration::from_secs(5)).await.unwrap();
        assert!(stream.peer_addr().is_ok());
        client.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_releases_the_port() {
        let listener = TransferListener::bind("127.0.0.1", 0, false).unwrap();
        let port = listener.port();

        let err = listener.accept_one(Duration::from_millis(100)).await;
        assert!(matches!(err, Err(AgentError::TransferTimeout(_))));

        // The port is free again.
        let again = TransferListener::bind("127.0.0.1", port, false).unwrap();
        assert_eq!(again.port(), port);
    }

    #[tokio::test]
    async fn caller_assigned_port_collision_is_protocol_error() {
        let first = TransferListener::bind("127.0.0.1", 0, false).unwrap();
        let port = first.port();
        let err = TransferListener::bind("127.0.0.1", port, false).unwrap_err();
        assert!(matches!(err, AgentError::TransferProtocol(_)));
    }
}
