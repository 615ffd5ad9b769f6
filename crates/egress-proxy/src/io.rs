//! Bidirectional copy with half-close, shared by the HTTP CONNECT tunnel and
//! the transparent TLS tunnel.
//!
//! A plain back-to-back `tokio::io::copy` pair hangs against a server that
//! sends its response and then closes its write half: the client's read side
//! never sees EOF because our copy loop is still waiting on the client to
//! close first. Shutting down the peer's write half as soon as one direction
//! finishes breaks that deadlock.

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::warn;

/// Grace budget every listener gives in-flight connection tasks to finish on
/// their own before being aborted.
pub const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

/// Wait up to [`GRACEFUL_SHUTDOWN`] for every task in `connections` to finish
/// on its own; abort whatever remains once the budget elapses. `listener`
/// names the caller in the warning log.
pub async fn drain_within_grace_period(mut connections: JoinSet<()>, listener: &str) {
    let drained = tokio::time::timeout(GRACEFUL_SHUTDOWN, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(listener, "graceful shutdown budget elapsed; aborting in-flight connections");
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

/// Byte counts and the first I/O error encountered by either direction, if
/// any. Non-fatal — a tunnel that hits an error still terminates cleanly.
pub struct TunnelOutcome {
    pub client_to_upstream_bytes: u64,
    pub upstream_to_client_bytes: u64,
    pub error: Option<std::io::Error>,
}

/// Run a full-duplex copy between `client` and `upstream` until both
/// directions finish, half-closing each peer's write side as soon as the
/// direction feeding it reaches EOF.
pub async fn tunnel(client: TcpStream, upstream: TcpStream) -> TunnelOutcome {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let client_to_upstream = async {
        let result = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        result
    };
    let upstream_to_client = async {
        let result = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (c2u_result, u2c_result) = tokio::join!(client_to_upstream, upstream_to_client);

    let (client_to_upstream_bytes, c2u_err) = match c2u_result {
        Ok(n) => (n, None),
        Err(e) => (0, Some(e)),
    };
    let (upstream_to_client_bytes, u2c_err) = match u2c_result {
        Ok(n) => (n, None),
        Err(e) => (0, Some(e)),
    };

    TunnelOutcome {
        client_to_upstream_bytes,
        upstream_to_client_bytes,
        error: c2u_err.or(u2c_err),
    }
}
