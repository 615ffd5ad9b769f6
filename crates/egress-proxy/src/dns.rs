//! DNS proxy: a dual UDP+TCP DNS server sharing one Matcher.
//! Matching is purely on the first question's QNAME; every query type is
//! treated identically.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sbx_egress_policy::{normalize, Action};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::config::ListenerConfig;
use crate::error::{Error, Result};
use crate::io::drain_within_grace_period;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_UDP_PACKET: usize = 4096;
const RCODE_REFUSED: u8 = 3;
const RCODE_SERVER_FAILURE: u8 = 2;

/// The DNS proxy listener: one UDP socket and one TCP listener bound to the
/// same address, sharing the Matcher and an upstream resolver address.
pub struct DnsProxy {
    config: ListenerConfig,
    upstream: SocketAddr,
}

impl DnsProxy {
    #[must_use]
    pub fn new(config: ListenerConfig, upstream: SocketAddr) -> Self {
        Self { config, upstream }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.config.listen_addr;
        let udp_socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .map_err(|source| Error::BindError { addr: addr.to_string(), source })?,
        );
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::BindError { addr: addr.to_string(), source })?;
        info!(%addr, "dns proxy listening (udp+tcp)");

        let matcher = Arc::clone(&self.config.matcher);
        let upstream = self.upstream;
        let mut queries = JoinSet::new();
        let mut recv_buf = vec![0u8; MAX_UDP_PACKET];

        loop {
            tokio::select! {
                result = udp_socket.recv_from(&mut recv_buf) => {
                    match result {
                        Ok((len, peer)) => {
                            let packet = recv_buf[..len].to_vec();
                            let matcher = Arc::clone(&matcher);
                            let reply_socket = Arc::clone(&udp_socket);
                            queries.spawn(async move {
                                let response = process_query(&packet, &matcher, upstream).await;
                                if let Err(e) = reply_socket.send_to(&response, peer).await {
                                    warn!(%peer, error = %e, "failed to send DNS UDP response");
                                }
                            });
                        },
                        Err(e) => warn!(error = %e, "dns proxy udp recv error"),
                    }
                },
                accept = tcp_listener.accept() => {
                    match accept {
                        Ok((stream, peer)) => {
                            let matcher = Arc::clone(&matcher);
                            queries.spawn(async move {
                                if let Err(e) = handle_tcp_connection(stream, &matcher, upstream).await {
                                    debug!(%peer, error = %e, "dns proxy tcp connection error");
                                }
                            });
                        },
                        Err(e) => warn!(error = %e, "dns proxy tcp accept error"),
                    }
                },
                () = cancel.cancelled() => {
                    info!(%addr, "dns proxy shutting down");
                    break;
                },
            }
        }

        drain_within_grace_period(queries, "dns").await;
        Ok(())
    }
}

/// Handle one TCP DNS connection: repeatedly read a 2-byte length-prefixed
/// query, process it, and write back a length-prefixed response. EOF on the
/// length prefix ends the connection normally.
async fn handle_tcp_connection(
    mut stream: TcpStream,
    matcher: &sbx_egress_policy::Matcher,
    upstream: SocketAddr,
) -> Result<()> {
    loop {
        let query_len = match read_message_length(&mut stream).await {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        };
        if query_len == 0 {
            continue;
        }

        let mut query = vec![0u8; query_len];
        stream.read_exact(&mut query).await?;

        let response = process_query(&query, matcher, upstream).await;
        write_message(&mut stream, &response).await?;
    }
}

/// Normalize the query's QNAME, apply the Matcher, and produce the response
/// bytes: REFUSED on deny, the upstream's reply on allow, SERVFAIL if the
/// upstream is unreachable.
#[instrument(skip(query, matcher), fields(upstream = %upstream))]
async fn process_query(query: &[u8], matcher: &sbx_egress_policy::Matcher, upstream: SocketAddr) -> Vec<u8> {
    #[cfg(feature = "metrics")]
    counter!("dns_proxy_queries_total").increment(1);

    let Some(question) = parse_dns_question(query) else {
        return build_response(query, RCODE_REFUSED);
    };
    let domain = normalize(&question);

    if matcher.action_for(&domain) == Action::Deny {
        info!(%domain, action = "deny", reason = "rule-match", "denied DNS query");
        #[cfg(feature = "metrics")]
        counter!("dns_proxy_queries_denied_total").increment(1);
        return build_response(query, RCODE_REFUSED);
    }

    match forward_to_upstream(query, upstream).await {
        Ok(response) => response,
        Err(e) => {
            debug!(%domain, error = %e, "dns upstream query failed");
            build_response(query, RCODE_SERVER_FAILURE)
        },
    }
}

/// Forward the query to `upstream` over a fresh ephemeral UDP socket and
/// return its response bytes, bounded by [`UPSTREAM_TIMEOUT`].
async fn forward_to_upstream(query: &[u8], upstream: SocketAddr) -> std::io::Result<Vec<u8>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.send_to(query, upstream).await?;

    let mut buf = vec![0u8; MAX_UDP_PACKET];
    let len = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "dns upstream query timed out"))??;
    Ok(buf[..len].to_vec())
}

/// Read a 2-byte big-endian TCP length prefix.
async fn read_message_length<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<usize> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await?;
    Ok(u16::from_be_bytes(len_buf) as usize)
}

/// Write a length-prefixed DNS message.
async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &[u8]) -> Result<()> {
    let len = (message.len() as u16).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(message).await?;
    Ok(())
}

/// Parse the first question's QNAME out of a DNS message. Returns `None` for
/// a too-short header, zero questions, or a malformed label sequence.
fn parse_dns_question(packet: &[u8]) -> Option<String> {
    if packet.len() < 12 {
        return None;
    }
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount == 0 {
        return None;
    }

    let mut pos = 12;
    let mut labels = Vec::new();
    loop {
        let label_len = *packet.get(pos)? as usize;
        pos += 1;
        if label_len == 0 {
            break;
        }
        let label = packet.get(pos..pos + label_len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += label_len;
    }
    Some(labels.join("."))
}

/// Build a response from `query`: copy the header and question section,
/// flip the QR bit to response, set the given rcode, and zero every answer
/// count (REFUSED/SERVFAIL carry no records).
fn build_response(query: &[u8], rcode: u8) -> Vec<u8> {
    if query.len() < 12 {
        return Vec::new();
    }
    let mut response = query.to_vec();
    response[2] |= 0x80; // QR = 1 (response)
    response[3] = (response[3] & 0xF0) | (rcode & 0x0F);
    response[6..12].copy_from_slice(&[0, 0, 0, 0, 0, 0]); // AN/NS/AR counts
    response
}
