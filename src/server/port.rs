//! Free-port discovery.
//!
//! Ports are probed by binding a listening socket.  The socket that
//! succeeds is returned still bound, and the server adopts it, so no other
//! process can claim the port between discovery and launch.

use std::net::{IpAddr, SocketAddr, TcpListener};

use tracing::{debug, trace};

use super::ServerError;

/// A bound loopback listener together with the port it holds.
#[derive(Debug)]
pub struct PortReservation {
    pub port: u16,
    pub listener: TcpListener,
}

/// Bind the first free port in `start .. start + span`.
///
/// Returns [`ServerError::ResourceExhausted`] when every port in the range
/// is taken (or the range runs past 65535).
pub fn find_available_port(
    host: IpAddr,
    start: u16,
    span: u16,
) -> Result<PortReservation, ServerError> {
    let end = u32::from(start) + u32::from(span.max(1)) - 1;
    for port in u32::from(start)..=end.min(u32::from(u16::MAX)) {
        // `port` is within u16 range by construction of the bound above.
        let port = port as u16;
        match TcpListener::bind(SocketAddr::new(host, port)) {
            Ok(listener) => {
                debug!(%host, port, "reserved listening port");
                return Ok(PortReservation { port, listener });
            }
            Err(e) => trace!(%host, port, error = %e, "port unavailable"),
        }
    }
    Err(ServerError::ResourceExhausted { start, end })
}
