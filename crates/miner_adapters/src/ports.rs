//! Ephemeral API port allocation.

use crate::{MinerError, Result};
use std::net::TcpListener;

/// Ask the OS for a free localhost port: bind to zero, read the
/// assignment, release. The returned port is only reserved in the sense
/// that nothing else held it a moment ago, which is enough for a miner
/// API that binds immediately after spawn.
pub fn allocate_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| MinerError::StartFailed(format!("no free local port: {}", e)))?;
    let port = listener
        .local_addr()
        .map_err(|e| MinerError::StartFailed(format!("no free local port: {}", e)))?
        .port();
    drop(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_usable_ports() {
        let a = allocate_port().unwrap();
        let b = allocate_port().unwrap();
        assert!(a >= 1024);
        assert!(b >= 1024);
        // Released ports can be bound again.
        TcpListener::bind(("127.0.0.1", a)).unwrap();
    }
}
