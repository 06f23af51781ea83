//! Ephemeral UDP port allocation.

use std::net::{IpAddr, UdpSocket};

use crate::error::{BridgeError, Result};

/// Ask the kernel for an unused UDP port on `host` by binding to port 0 and
/// immediately releasing the socket.
///
/// The returned port is advisory only: another process may grab it between
/// the release and the caller's own bind. Callers are expected to retry on
/// downstream bind failures.
pub fn allocate_udp_port(host: IpAddr) -> Result<u16> {
    let socket = UdpSocket::bind((host, 0)).map_err(BridgeError::PortBind)?;
    let port = socket.local_addr().map_err(BridgeError::PortBind)?.port();
    drop(socket);
    Ok(port)
}
