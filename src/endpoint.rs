//! Transport seam.
//!
//! The session engine never touches sockets. It writes through this trait
//! and drives its half-close protocol with `shutdown_output` (after a
//! GO_AWAY flush, so straggler frames can still be read) and `close` (on
//! peer FIN, idle timeout, or termination).

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

pub trait Endpoint: Send + Sync {
    /// Write the whole buffer to the transport.
    fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Shut down the write half, leaving the read half open.
    fn shutdown_output(&self);

    /// Close both halves.
    fn close(&self);

    fn is_open(&self) -> bool;

    /// Idle timeout configured on the transport.
    fn idle_timeout(&self) -> Duration;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}
