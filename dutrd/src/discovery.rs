//! UDP discovery responder.
//!
//! Lab clients find agents by broadcasting `SimpleJsonRpc Ping`; every
//! agent answers with its RPC port as a 4-byte little-endian integer so
//! the client can connect without preconfigured addresses.

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use dutr_common::protocol::DISCOVERY_PING;

/// Bind the responder and serve pings until the process exits.
///
/// Datagrams with any other payload are ignored. Bind failure is
/// returned so the caller can decide whether discovery is optional.
pub async fn run(bind_address: &str, discovery_port: u16, rpc_port: u16) -> std::io::Result<()> {
    let socket = UdpSocket::bind((bind_address, discovery_port)).await?;
    info!(discovery_port, rpc_port, "discovery responder listening");

    let reply = rpc_port_payload(rpc_port);
    let mut buf = [0u8; 64];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                if &buf[..len] == DISCOVERY_PING {
                    debug!(%peer, "discovery ping");
                    if let Err(err) = socket.send_to(&reply, peer).await {
                        warn!(%peer, %err, "discovery reply failed");
                    }
                } else {
                    debug!(%peer, len, "ignoring non-ping datagram");
                }
            }
            Err(err) => {
                warn!(%err, "discovery receive error");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Wire encoding of the RPC port: 4 bytes, little endian.
pub fn rpc_port_payload(rpc_port: u16) -> [u8; 4] {
    u32::from(rpc_port).to_le_bytes()
}
