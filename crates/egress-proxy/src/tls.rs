//! Transparent TLS proxy: peek the ClientHello for SNI, apply policy, then
//! tunnel the handshake byte-for-byte to the real destination. Never
//! terminates TLS and never inspects anything cryptographic beyond a server
//! certificate's SAN/CN, read in cleartext from a TLS 1.2 handshake.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use sbx_egress_policy::{normalize, Action};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::X509Certificate;

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

use crate::config::{ListenerConfig, Resolver};
use crate::error::{Error, Result};
use crate::io::{drain_within_grace_period, tunnel};

const CLIENT_HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const IP_OVERLAP_TIMEOUT: Duration = Duration::from_secs(5);
const CERT_PEEK_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RECORD_LEN: usize = 16384;
const MAX_CERT_PEEK_RECORDS: usize = 10;

const RECORD_HANDSHAKE: u8 = 22;
const RECORD_CHANGE_CIPHER_SPEC: u8 = 20;
const RECORD_APPLICATION_DATA: u8 = 23;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_CERTIFICATE: u8 = 11;

/// The transparent TLS proxy listener.
pub struct TlsProxy {
    config: ListenerConfig,
}

impl TlsProxy {
    #[must_use]
    pub fn new(config: ListenerConfig) -> Self {
        Self { config }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::BindError { addr: addr.to_string(), source })?;
        info!(%addr, "tls proxy listening");

        let config = Arc::new(self.config);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accept = listener.accept() => {
                    match accept {
                        Ok((stream, peer)) => {
                            let config = Arc::clone(&config);
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, config).await {
                                    debug!(%peer, error = %e, "tls proxy connection error");
                                }
                            });
                        },
                        Err(e) => warn!(error = %e, "tls proxy accept error"),
                    }
                },
                () = cancel.cancelled() => {
                    info!(%addr, "tls proxy shutting down");
                    break;
                },
            }
        }

        drain_within_grace_period(connections, "tls").await;
        Ok(())
    }
}

/// Per-connection state machine:
/// `Reading ClientHello -> MatchingSNI -> (ResolvingForOverlap)? -> Dialing ->
/// ReplayingHello -> (ReadingServerCert)? -> Tunneling -> Closed`. Any
/// failure jumps straight to `Closed` (returning `Ok(())` — a denied or
/// malformed handshake is not itself an error).
#[instrument(skip(client, config), fields(peer = %peer))]
async fn handle_connection(client: TcpStream, peer: SocketAddr, config: Arc<ListenerConfig>) -> Result<()> {
    #[cfg(feature = "metrics")]
    {
        counter!("tls_proxy_connections_total").increment(1);
        gauge!("tls_proxy_connections_active").increment(1.0);
    }

    let result = handle_connection_inner(client, peer, config).await;

    #[cfg(feature = "metrics")]
    gauge!("tls_proxy_connections_active").decrement(1.0);

    result
}

async fn handle_connection_inner(mut client: TcpStream, peer: SocketAddr, config: Arc<ListenerConfig>) -> Result<()> {
    let hello = match read_client_hello(&mut client).await {
        Ok(hello) => hello,
        Err(e) => {
            debug!(%peer, error = %e, "failed to read ClientHello; closing");
            return Ok(());
        },
    };

    let Some(sni) = hello.server_name else {
        debug!(%peer, "ClientHello carried no SNI; closing");
        return Ok(());
    };
    let domain = normalize(&sni);

    if domain.is_empty() {
        info!(%peer, sni = %sni, action = "deny", reason = "ip-address", "denied TLS connection to IP literal SNI");
        return Ok(());
    }

    if config.matcher.action_for(&domain) == Action::Deny {
        info!(%peer, %domain, action = "deny", reason = "rule-match", "denied TLS connection");
        return Ok(());
    }

    let denied_domains = config.matcher.denied_domains();
    if !denied_domains.is_empty()
        && ip_overlap_detected(config.resolver.as_ref(), &domain, &denied_domains).await
    {
        info!(%peer, %domain, action = "deny", reason = "ip-overlap", "denied TLS connection (IP-overlap defense)");
        return Ok(());
    }

    let target_addr = match resolve_sni(config.resolver.as_ref(), &domain).await {
        Ok(addr) => addr,
        Err(e) => {
            debug!(%peer, %domain, error = %e, "failed to resolve SNI target");
            return Ok(());
        },
    };
    let mut upstream = match config.dialer.dial(target_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(%peer, %domain, error = %e, "failed to dial TLS target");
            return Ok(());
        },
    };
    upstream.write_all(&hello.raw_record).await?;

    if !denied_domains.is_empty() {
        let peek = peek_server_certificate(&mut upstream).await?;
        if let Some(leaf_der) = &peek.leaf_certificate_der {
            for name in extract_certificate_names(leaf_der)? {
                if config.matcher.action_for(&name) == Action::Deny {
                    info!(%peer, %domain, cert_name = %name, action = "deny", reason = "cert-san", "denied TLS connection (certificate SAN defense)");
                    return Ok(());
                }
            }
        }
        client.write_all(&peek.raw_records).await?;
    }

    let outcome = tunnel(client, upstream).await;
    if let Some(e) = outcome.error {
        debug!(%peer, %domain, error = %e, "TLS tunnel ended with error");
    }
    info!(
        %peer, %domain, action = "allow", protocol = "tls",
        bytes_sent = outcome.client_to_upstream_bytes,
        bytes_received = outcome.upstream_to_client_bytes,
        "TLS tunnel closed"
    );
    Ok(())
}

struct ClientHelloPeek {
    /// The full first TLS record (5-byte header + body), replayed verbatim
    /// to the dialed target.
    raw_record: Vec<u8>,
    server_name: Option<String>,
}

/// Read the first TLS record under a 5 s deadline, validate it is a
/// handshake record within the 16 KiB record-size ceiling, and pull the SNI
/// out of the ClientHello it carries.
async fn read_client_hello(client: &mut TcpStream) -> Result<ClientHelloPeek> {
    let (content_type, raw_record) = tokio::time::timeout(CLIENT_HELLO_TIMEOUT, read_tls_record(client))
        .await
        .map_err(|_| Error::ClientProtocol("timed out reading ClientHello".into()))??;

    if content_type != RECORD_HANDSHAKE {
        return Err(Error::ClientProtocol(format!(
            "expected handshake record (22), got content-type {content_type}"
        )));
    }

    let server_name = parse_client_hello_sni(&raw_record[5..])?;
    Ok(ClientHelloPeek { raw_record, server_name })
}

/// Read one TLS record: 5-byte header (content-type, 2-byte legacy version,
/// 2-byte big-endian length) plus that many body bytes. Returns the content
/// type and the full raw record (header + body) for verbatim replay.
async fn read_tls_record(stream: &mut TcpStream) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    let content_type = header[0];
    let length = u16::from_be_bytes([header[3], header[4]]) as usize;
    if length > MAX_RECORD_LEN {
        return Err(Error::ClientProtocol(format!("TLS record length {length} exceeds {MAX_RECORD_LEN}")));
    }
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;

    let mut raw = Vec::with_capacity(5 + length);
    raw.extend_from_slice(&header);
    raw.extend_from_slice(&body);
    Ok((content_type, raw))
}

/// Byte cursor over a handshake message body, used by both the ClientHello
/// SNI parser and the Certificate message parser.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::ClientProtocol("truncated TLS handshake message".into()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}

/// Parse a ClientHello handshake message (1-byte type, 3-byte length, body)
/// out of a TLS record body and return its `server_name` extension value,
/// if present.
fn parse_client_hello_sni(record_body: &[u8]) -> Result<Option<String>> {
    let mut cursor = Cursor::new(record_body);
    let handshake_type = cursor.u8()?;
    if handshake_type != HANDSHAKE_CLIENT_HELLO {
        return Err(Error::ClientProtocol(format!(
            "expected ClientHello (1), got handshake type {handshake_type}"
        )));
    }
    let _handshake_len = cursor.u24()?;
    let _legacy_version = cursor.u16()?;
    cursor.take(32)?; // random

    let session_id_len = cursor.u8()? as usize;
    cursor.take(session_id_len)?;

    let cipher_suites_len = cursor.u16()? as usize;
    cursor.take(cipher_suites_len)?;

    let compression_len = cursor.u8()? as usize;
    cursor.take(compression_len)?;

    if cursor.remaining() == 0 {
        return Ok(None);
    }
    let extensions_len = cursor.u16()? as usize;
    let extensions_end = cursor.pos + extensions_len.min(cursor.remaining());

    while cursor.pos + 4 <= extensions_end {
        let ext_type = cursor.u16()?;
        let ext_len = cursor.u16()? as usize;
        let ext_data = cursor.take(ext_len)?;
        if ext_type == 0 {
            return Ok(parse_server_name_extension(ext_data));
        }
    }
    Ok(None)
}

/// `server_name` extension body: 2-byte list length, then entries of
/// `name_type(1) + name_len(2) + name`. Only `name_type == 0` (host_name) is
/// meaningful.
fn parse_server_name_extension(data: &[u8]) -> Option<String> {
    let mut cursor = Cursor::new(data);
    let _list_len = cursor.u16().ok()?;
    loop {
        if cursor.remaining() < 3 {
            return None;
        }
        let name_type = cursor.u8().ok()?;
        let name_len = cursor.u16().ok()? as usize;
        let name = cursor.take(name_len).ok()?;
        if name_type == 0 {
            return std::str::from_utf8(name).ok().map(str::to_string);
        }
    }
}

/// Resolve both the SNI and every explicitly denied non-wildcard domain;
/// deny when any address overlaps. DNS failures fail-open (logged, not
/// fatal) so transient resolver issues don't cause blanket TLS outages.
async fn ip_overlap_detected(resolver: &dyn Resolver, sni: &str, denied_domains: &[String]) -> bool {
    let sni_ips = match tokio::time::timeout(IP_OVERLAP_TIMEOUT, resolver.lookup_host(sni)).await {
        Ok(Ok(ips)) => ips,
        Ok(Err(e)) => {
            debug!(error = %e, sni, "SNI resolution failed for IP-overlap check; fail-open");
            return false;
        },
        Err(_) => {
            debug!(sni, "SNI resolution timed out for IP-overlap check; fail-open");
            return false;
        },
    };
    let sni_ips: HashSet<IpAddr> = sni_ips.into_iter().collect();
    if sni_ips.is_empty() {
        return false;
    }

    for domain in denied_domains {
        match tokio::time::timeout(IP_OVERLAP_TIMEOUT, resolver.lookup_host(domain)).await {
            Ok(Ok(ips)) => {
                if ips.iter().any(|ip| sni_ips.contains(ip)) {
                    return true;
                }
            },
            Ok(Err(e)) => debug!(error = %e, %domain, "denied-domain resolution failed; fail-open"),
            Err(_) => debug!(%domain, "denied-domain resolution timed out; fail-open"),
        }
    }
    false
}

async fn resolve_sni(resolver: &dyn Resolver, sni: &str) -> Result<SocketAddr> {
    if let Ok(ip) = sni.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 443));
    }
    let addrs = resolver
        .lookup_host(sni)
        .await
        .map_err(|e| Error::UpstreamDial(e.to_string()))?;
    addrs
        .into_iter()
        .next()
        .map(|ip| SocketAddr::new(ip, 443))
        .ok_or_else(|| Error::UpstreamDial(format!("no addresses found for {sni}")))
}

struct ServerCertificatePeek {
    /// Every byte read from the server while peeking, replayed to the client
    /// verbatim once inspection is done.
    raw_records: Vec<u8>,
    leaf_certificate_der: Option<Vec<u8>>,
}

/// Read up to [`MAX_CERT_PEEK_RECORDS`] records from the server (10 s total
/// budget), looking for a `Certificate` handshake message. Stops at the
/// first `ChangeCipherSpec`/`ApplicationData` record (TLS 1.3, certificate
/// encrypted) and fails open.
async fn peek_server_certificate(upstream: &mut TcpStream) -> Result<ServerCertificatePeek> {
    let mut raw_records = Vec::new();
    let mut handshake_buf = Vec::new();
    let mut leaf_certificate_der = None;

    let read = tokio::time::timeout(CERT_PEEK_TIMEOUT, async {
        for _ in 0..MAX_CERT_PEEK_RECORDS {
            let (content_type, raw_record) = match read_tls_record(upstream).await {
                Ok(record) => record,
                Err(_) => break,
            };
            raw_records.extend_from_slice(&raw_record);

            if content_type == RECORD_CHANGE_CIPHER_SPEC || content_type == RECORD_APPLICATION_DATA {
                break;
            }
            if content_type == RECORD_HANDSHAKE {
                handshake_buf.extend_from_slice(&raw_record[5..]);
                if let Some(der) = find_certificate_message(&handshake_buf)? {
                    leaf_certificate_der = Some(der);
                    break;
                }
            }
        }
        Ok::<(), Error>(())
    })
    .await;

    match read {
        Ok(result) => result?,
        Err(_) => debug!("certificate peek timed out; fail-open"),
    }

    Ok(ServerCertificatePeek { raw_records, leaf_certificate_der })
}

/// Scan accumulated handshake bytes for a complete `Certificate` message
/// (type 11) and return its leaf (first) certificate's DER bytes.
fn find_certificate_message(buf: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut pos = 0;
    while pos + 4 <= buf.len() {
        let msg_type = buf[pos];
        let len = u32::from_be_bytes([0, buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
        if pos + 4 + len > buf.len() {
            break; // message not fully buffered yet
        }
        if msg_type == HANDSHAKE_CERTIFICATE {
            let body = &buf[pos + 4..pos + 4 + len];
            return Ok(Some(parse_leaf_certificate(body)?));
        }
        pos += 4 + len;
    }
    Ok(None)
}

/// `Certificate` message body: 3-byte `certificate_list` length, then
/// repeated `3-byte cert length + cert DER`. The first entry is the leaf.
fn parse_leaf_certificate(body: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(body);
    let list_len = cursor.u24()? as usize;
    if list_len < 3 {
        return Err(Error::ClientProtocol("empty certificate list".into()));
    }
    let cert_len = cursor.u24()? as usize;
    Ok(cursor.take(cert_len)?.to_vec())
}

/// Lowercased DNS SAN entries plus the Subject CN, extracted from a leaf
/// certificate's DER encoding.
fn extract_certificate_names(der: &[u8]) -> Result<Vec<String>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::ClientProtocol(format!("failed to parse server certificate: {e}")))?;

    let mut names = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::DNSName(dns) = name {
                    names.push(dns.to_ascii_lowercase());
                }
            }
        }
    }
    for cn in cert.subject().iter_common_name() {
        if let Ok(cn_str) = cn.as_str() {
            names.push(cn_str.to_ascii_lowercase());
        }
    }
    Ok(names)
}
