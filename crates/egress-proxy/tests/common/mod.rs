//! Shared test fixtures: ephemeral ports, a fixed-answer `Resolver`, and a
//! minimal HTTP-200 fake upstream, used across the listener integration
//! tests.

#![allow(clippy::unwrap_used)]

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use sbx_egress_proxy::{Dialer, Resolver};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Reserve an ephemeral loopback port, then release it for a listener under
/// test to bind.
pub fn free_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Give a just-spawned listener task a moment to bind before a test client
/// connects to it.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Resolves every hostname to the same fixed IP address, so tests can point
/// proxied traffic at a loopback fixture regardless of the requested domain.
pub struct FixedResolver(pub IpAddr);

#[async_trait]
impl Resolver for FixedResolver {
    async fn lookup_host(&self, _host: &str) -> std::io::Result<Vec<IpAddr>> {
        Ok(vec![self.0])
    }
}

/// Dials the same fixed address regardless of what the listener asked for —
/// used to redirect the TLS proxy's hardcoded `:443` dial to an ephemeral
/// loopback fixture.
pub struct FixedDialer(pub SocketAddr);

#[async_trait]
impl Dialer for FixedDialer {
    async fn dial(&self, _addr: SocketAddr) -> std::io::Result<TcpStream> {
        TcpStream::connect(self.0).await
    }
}

/// Accept exactly one connection, read and discard its request line and
/// headers, then reply with a fixed `200 OK` body. Returns once the
/// response has been written.
pub async fn serve_one_http_200(addr: SocketAddr, body: &'static str) {
    let listener = TcpListener::bind(addr).await.unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        if line.trim().is_empty() {
            break;
        }
    }
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    reader.get_mut().write_all(response.as_bytes()).await.unwrap();
}

/// Connect to `addr`, write `request` verbatim, and return everything read
/// until the peer closes its write half.
pub async fn send_and_read_all(addr: SocketAddr, request: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}
