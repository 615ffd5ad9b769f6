//! HTTP forward proxy: plain HTTP forwarding and `CONNECT` tunneling on one
//! TCP port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sbx_egress_policy::{normalize, Action};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

use crate::config::{ListenerConfig, Resolver};
use crate::error::{Error, Result};
use crate::io::{drain_within_grace_period, tunnel};

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Budget for reading the upstream's response status line and headers
/// before tunneling the body.
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// The HTTP forward proxy listener: accepts connections on `listen_addr` and
/// serves both absolute-URI HTTP requests and `CONNECT` tunnels.
pub struct HttpProxy {
    config: ListenerConfig,
}

impl HttpProxy {
    #[must_use]
    pub fn new(config: ListenerConfig) -> Self {
        Self { config }
    }

    /// Accept connections until `cancel` fires, then stop accepting and give
    /// in-flight connections up to the graceful shutdown budget to finish.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::BindError { addr: addr.to_string(), source })?;
        info!(%addr, "http proxy listening");

        let config = Arc::new(self.config);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, peer)) => {
                            let config = Arc::clone(&config);
                            connections.spawn(async move {
                                if let Err(e) = handle_client(stream, peer, config).await {
                                    debug!(%peer, error = %e, "http proxy client error");
                                }
                            });
                        },
                        Err(e) => warn!(error = %e, "http proxy accept error"),
                    }
                },
                () = cancel.cancelled() => {
                    info!(%addr, "http proxy shutting down");
                    break;
                },
            }
        }

        drain_within_grace_period(connections, "http").await;
        Ok(())
    }
}

#[instrument(skip(stream, config), fields(peer = %peer))]
async fn handle_client(stream: TcpStream, peer: SocketAddr, config: Arc<ListenerConfig>) -> Result<()> {
    #[cfg(feature = "metrics")]
    {
        counter!("http_proxy_connections_total").increment(1);
        gauge!("http_proxy_connections_active").increment(1.0);
    }

    let result = handle_client_inner(stream, peer, config).await;

    #[cfg(feature = "metrics")]
    gauge!("http_proxy_connections_active").decrement(1.0);

    result
}

async fn handle_client_inner(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ListenerConfig>,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let request_line = request_line.trim_end();
    if request_line.is_empty() {
        return Err(Error::ClientProtocol("empty request line".into()));
    }

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(Error::ClientProtocol(format!("malformed request line: {request_line}")));
    }
    let method = parts[0];
    let target = parts[1];

    if method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(reader, peer, target, &config).await
    } else {
        handle_forward(reader, peer, method, target, &config).await
    }
}

/// Respond `403 Forbidden` with a `blocked by proxy policy` body prefix
/// naming the denial reason, then return.
async fn deny(reader: &mut BufReader<TcpStream>, reason: &str) -> Result<()> {
    let body = format!("blocked by proxy policy: {reason}");
    let resp = format!(
        "HTTP/1.1 403 Forbidden\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    reader.get_mut().write_all(resp.as_bytes()).await?;
    Ok(())
}

async fn deny_ip_literal(reader: &mut BufReader<TcpStream>, host: &str) -> Result<()> {
    let body = format!("blocked by proxy policy (IP addresses not allowed): {host}");
    let resp = format!(
        "HTTP/1.1 403 Forbidden\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    reader.get_mut().write_all(resp.as_bytes()).await?;
    Ok(())
}

async fn bad_gateway(reader: &mut BufReader<TcpStream>, err: &std::io::Error) -> Result<()> {
    let body = format!("upstream dial failed: {err}");
    let resp = format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    reader.get_mut().write_all(resp.as_bytes()).await?;
    Ok(())
}

/// `CONNECT host:port` — opaque TCP tunnel.
#[instrument(skip(reader, config), fields(peer = %peer, target = %target))]
async fn handle_connect(
    mut reader: BufReader<TcpStream>,
    peer: SocketAddr,
    target: &str,
    config: &ListenerConfig,
) -> Result<()> {
    // Consume the remaining request headers (CONNECT carries none that matter).
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.trim().is_empty() {
            break;
        }
    }

    let (host, port) = parse_host_port(target, 443);
    let domain = normalize(&host);

    if domain.is_empty() {
        info!(%peer, host = %host, action = "deny", reason = "ip-address", "denied CONNECT to IP literal");
        deny_ip_literal(&mut reader, &host).await?;
        return Ok(());
    }

    match config.matcher.action_for(&domain) {
        Action::Deny => {
            info!(%peer, %domain, action = "deny", reason = "rule-match", "denied CONNECT");
            deny(&mut reader, &domain).await?;
            return Ok(());
        },
        Action::Allow => {},
    }

    let upstream_addr = resolve_target(config.resolver.as_ref(), &host, port).await?;
    let upstream = match config.dialer.dial(upstream_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%peer, %domain, error = %e, "CONNECT upstream dial failed");
            bad_gateway(&mut reader, &e).await?;
            return Ok(());
        },
    };

    reader
        .get_mut()
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    let client = reader.into_inner();
    let outcome = tunnel(client, upstream).await;
    if let Some(e) = outcome.error {
        debug!(%peer, %domain, error = %e, "CONNECT tunnel ended with error");
    }
    info!(
        %peer, %domain, action = "allow", protocol = "http-connect",
        bytes_sent = outcome.client_to_upstream_bytes,
        bytes_received = outcome.upstream_to_client_bytes,
        "CONNECT tunnel closed"
    );
    Ok(())
}

/// Plain HTTP forward request (absolute-URI proxy semantics).
#[instrument(skip(reader, config), fields(peer = %peer, method = %method, target = %target))]
async fn handle_forward(
    mut reader: BufReader<TcpStream>,
    peer: SocketAddr,
    method: &str,
    target: &str,
    config: &ListenerConfig,
) -> Result<()> {
    let mut headers = String::new();
    let mut host_header: Option<String> = None;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") {
                host_header = Some(value.trim().to_string());
            }
        }
        if !is_hop_by_hop(&line) {
            headers.push_str(&line);
        }
    }

    let host_header = host_header
        .ok_or_else(|| Error::ClientProtocol("HTTP forward request missing Host header".into()))?;
    let (host, port) = parse_host_port(&host_header, default_port_for(target));
    let domain = normalize(&host);

    if domain.is_empty() {
        info!(%peer, host = %host, action = "deny", reason = "ip-address", "denied HTTP request to IP literal");
        deny_ip_literal(&mut reader, &host).await?;
        return Ok(());
    }

    if config.matcher.action_for(&domain) == Action::Deny {
        info!(%peer, %domain, action = "deny", reason = "rule-match", "denied HTTP request");
        deny(&mut reader, &domain).await?;
        return Ok(());
    }

    let upstream_addr = resolve_target(config.resolver.as_ref(), &host, port).await?;
    let mut upstream = match config.dialer.dial(upstream_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%peer, %domain, error = %e, "HTTP forward upstream dial failed");
            bad_gateway(&mut reader, &e).await?;
            return Ok(());
        },
    };

    let path = request_path(target);
    let request_line = format!("{method} {path} HTTP/1.1\r\n");
    upstream.write_all(request_line.as_bytes()).await?;
    upstream.write_all(headers.as_bytes()).await?;
    upstream.write_all(b"\r\n").await?;

    let mut upstream_reader = BufReader::new(upstream);
    let response_head = match read_and_filter_response_head(&mut upstream_reader).await {
        Ok(head) => head,
        Err(e) => {
            warn!(%peer, %domain, error = %e, "HTTP forward response header read failed");
            bad_gateway(&mut reader, &e).await?;
            return Ok(());
        },
    };

    let mut client = reader.into_inner();
    client.write_all(&response_head).await?;

    let upstream = upstream_reader.into_inner();
    let outcome = tunnel(client, upstream).await;
    if let Some(e) = outcome.error {
        debug!(%peer, %domain, error = %e, "HTTP forward ended with error");
    }
    info!(
        %peer, %domain, action = "allow", protocol = "http-forward",
        bytes_sent = outcome.client_to_upstream_bytes,
        bytes_received = outcome.upstream_to_client_bytes,
        "HTTP forward request relayed"
    );
    Ok(())
}

fn is_hop_by_hop(header_line: &str) -> bool {
    let Some((name, _)) = header_line.split_once(':') else {
        return false;
    };
    let name = name.trim().to_ascii_lowercase();
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Read the upstream's status line and headers, stripping
/// [`HOP_BY_HOP_HEADERS`] before they're relayed to the client, under
/// [`RESPONSE_HEADER_TIMEOUT`]. The body is left untouched for the caller to
/// tunnel raw.
async fn read_and_filter_response_head<R: AsyncBufRead + Unpin>(upstream: &mut R) -> std::io::Result<Vec<u8>> {
    let read = tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, async {
        let mut head = Vec::new();

        let mut status_line = String::new();
        upstream.read_line(&mut status_line).await?;
        head.extend_from_slice(status_line.as_bytes());

        loop {
            let mut line = String::new();
            upstream.read_line(&mut line).await?;
            if line.trim().is_empty() {
                head.extend_from_slice(b"\r\n");
                break;
            }
            if !is_hop_by_hop(&line) {
                head.extend_from_slice(line.as_bytes());
            }
        }
        Ok(head)
    })
    .await;

    match read {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out reading upstream response headers",
        )),
    }
}

/// `host:port` or bare `host`, defaulting to `default_port` when no port is
/// present. Tolerates bracketed IPv6 literals.
fn parse_host_port(target: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = target.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = &rest[..end];
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host.to_string(), port);
        }
    }
    match target.rsplit_once(':') {
        Some((host, port_str)) if port_str.bytes().all(|b| b.is_ascii_digit()) && !port_str.is_empty() => {
            (host.to_string(), port_str.parse().unwrap_or(default_port))
        },
        _ => (target.to_string(), default_port),
    }
}

fn default_port_for(url: &str) -> u16 {
    if url.starts_with("https://") {
        443
    } else {
        80
    }
}

fn request_path(url: &str) -> String {
    let after_scheme = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    match after_scheme.find('/') {
        Some(pos) => after_scheme[pos..].to_string(),
        None => "/".to_string(),
    }
}

async fn resolve_target(resolver: &dyn Resolver, host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let addrs = resolver
        .lookup_host(host)
        .await
        .map_err(|e| Error::UpstreamDial(e.to_string()))?;
    addrs
        .into_iter()
        .next()
        .map(|ip| SocketAddr::new(ip, port))
        .ok_or_else(|| Error::UpstreamDial(format!("no addresses found for {host}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_with_explicit_port() {
        assert_eq!(parse_host_port("github.com:443", 80), ("github.com".to_string(), 443));
    }

    #[test]
    fn parses_host_without_port_defaults() {
        assert_eq!(parse_host_port("github.com", 443), ("github.com".to_string(), 443));
    }

    #[test]
    fn parses_bracketed_ipv6_with_port() {
        assert_eq!(parse_host_port("[::1]:8080", 443), ("::1".to_string(), 8080));
    }

    #[test]
    fn request_path_defaults_to_root() {
        assert_eq!(request_path("http://example.com"), "/");
        assert_eq!(request_path("http://example.com/a/b"), "/a/b");
    }

    #[test]
    fn hop_by_hop_header_detection() {
        assert!(is_hop_by_hop("Connection: keep-alive\r\n"));
        assert!(is_hop_by_hop("Transfer-Encoding: chunked\r\n"));
        assert!(!is_hop_by_hop("Host: example.com\r\n"));
    }

    #[tokio::test]
    async fn response_head_strips_hop_by_hop_headers() {
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(
                b"HTTP/1.1 200 OK\r\n\
                  Content-Type: text/plain\r\n\
                  Connection: keep-alive\r\n\
                  Transfer-Encoding: chunked\r\n\
                  \r\n\
                  body bytes",
            )
            .await
            .unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        let head = read_and_filter_response_head(&mut reader).await.unwrap();
        let head = String::from_utf8(head).unwrap();

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/plain"));
        assert!(!head.to_ascii_lowercase().contains("connection:"));
        assert!(!head.to_ascii_lowercase().contains("transfer-encoding:"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn response_head_read_times_out() {
        let (_client, server) = tokio::io::duplex(1024);
        let mut reader = BufReader::new(server);
        let read = tokio::spawn(async move { read_and_filter_response_head(&mut reader).await });
        tokio::time::advance(RESPONSE_HEADER_TIMEOUT + Duration::from_millis(1)).await;
        let result = read.await.unwrap();
        assert!(result.is_err());
    }
}
