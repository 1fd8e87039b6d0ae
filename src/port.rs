//! Free port allocation.
//!
//! Asks the OS for an ephemeral port by binding `127.0.0.1:0` and releasing it
//! straight away. Nothing is reserved: another process may grab the port
//! before the server binds it. That window is accepted as a rare flake.

use crate::error::{HarnessError, Result};
use std::net::TcpListener;

/// Return a port that was unbound at the instant of the call.
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(HarnessError::ResourceExhausted)?;
    let port = listener
        .local_addr()
        .map_err(HarnessError::ResourceExhausted)?
        .port();
    drop(listener);
    tracing::trace!(port, "allocated free port");
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_port_is_bindable() {
        let port = free_port().unwrap();
        assert_ne!(port, 0);
        // Racy by nature, but nothing else on a test host should win it this fast.
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn test_free_port_twice_differs() {
        let first = free_port().unwrap();
        let second = free_port().unwrap();
        // Ephemeral allocation rarely hands the same port back immediately.
        assert_ne!(first, second);
    }
}
