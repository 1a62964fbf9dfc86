// Kube Tunnel Manager - Port Health Probe
// Active TCP check that a tunnel's local listener is actually accepting

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether something is accepting TCP connections on 127.0.0.1:port
///
/// A successful connect proves the listener is serving; a failure does not
/// distinguish "not yet started" from "crashed" — callers combine this with
/// process liveness and stage status.
pub async fn local_port_open(port: u16) -> bool {
    matches!(
        timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn detects_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(local_port_open(port).await);
    }

    #[tokio::test]
    async fn detects_closed_port() {
        // Bind then drop so the port is known-free
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!local_port_open(port).await);
    }
}
