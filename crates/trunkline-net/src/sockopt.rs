//! TCP socket options.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Keepalive tuning applied to every connection.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Interval between probes.
    pub interval: Duration,
    /// Probes sent before the connection is declared dead.
    pub retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            idle: Duration::from_secs(5),
            interval: Duration::from_secs(3),
            retries: 3,
        }
    }
}

/// Applies TCP_NODELAY and keepalive to a freshly connected or accepted
/// stream. TCP_NODELAY is unconditional.
pub(crate) fn apply(stream: &TcpStream, keepalive: &KeepaliveConfig) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    let params = TcpKeepalive::new()
        .with_time(keepalive.idle)
        .with_interval(keepalive.interval)
        .with_retries(keepalive.retries);
    sock.set_tcp_keepalive(&params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_apply_on_live_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let stream = TcpStream::connect(addr).await.unwrap();

        apply(&stream, &KeepaliveConfig::default()).unwrap();
        assert!(stream.nodelay().unwrap());

        accept.await.unwrap();
    }
}
