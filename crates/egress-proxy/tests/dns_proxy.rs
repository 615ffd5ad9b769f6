//! End-to-end DNS proxy scenarios: an allowed query is forwarded and its
//! answer relayed, and a denied query never reaches the upstream resolver.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{free_port, settle};
use sbx_egress_policy::{Action, Matcher, Rule};
use sbx_egress_proxy::{DnsProxy, ListenerConfig};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

fn rule(action: Action, domain: &str) -> Rule {
    Rule { action, domain: domain.to_string() }
}

fn a_query(transaction_id: u16, name: &str) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]); // standard query
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in name.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // QTYPE=A QCLASS=IN
    packet
}

async fn spawn_dns_proxy(matcher: Matcher, upstream: std::net::SocketAddr) -> (std::net::SocketAddr, CancellationToken) {
    let addr = free_port();
    let config = ListenerConfig::new(addr, Arc::new(matcher));
    let cancel = CancellationToken::new();
    let proxy_cancel = cancel.clone();
    tokio::spawn(async move {
        let _ = DnsProxy::new(config, upstream).run(proxy_cancel).await;
    });
    settle().await;
    (addr, cancel)
}

/// Row 7: with no rules and a deny-by-default policy, any query is refused
/// without ever reaching the upstream resolver.
#[tokio::test]
async fn denied_query_never_contacts_upstream() {
    // An upstream address nothing listens on: if the proxy tried to forward
    // here, the client would see SERVFAIL (timeout) rather than REFUSED.
    let dead_upstream = free_port();
    let matcher = Matcher::new(Action::Deny, vec![]);
    let (proxy_addr, cancel) = spawn_dns_proxy(matcher, dead_upstream).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let query = a_query(0x1234, "anything.example");
    client.send_to(&query, proxy_addr).await.unwrap();

    let mut buf = vec![0u8; 512];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = &buf[..n];

    assert_eq!(&response[0..2], &[0x12, 0x34]);
    assert_eq!(response[3] & 0x0F, 3, "expected Rcode=REFUSED (3)");

    cancel.cancel();
}

/// Row 6: an allowed query is forwarded to the upstream resolver and its
/// response relayed back with the original transaction id preserved.
#[tokio::test]
async fn allowed_query_is_forwarded_and_relayed() {
    let upstream_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_socket.local_addr().unwrap();

    let upstream_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        let (n, peer) = upstream_socket.recv_from(&mut buf).await.unwrap();
        let mut response = buf[..n].to_vec();
        response[2] |= 0x80; // QR = response
        response.extend_from_slice(&[127, 0, 0, 42]); // pretend answer bytes
        upstream_socket.send_to(&response, peer).await.unwrap();
    });

    let matcher = Matcher::new(Action::Deny, vec![rule(Action::Allow, "*.example.com")]);
    let (proxy_addr, cancel) = spawn_dns_proxy(matcher, upstream_addr).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let query = a_query(0xABCD, "api.example.com");
    client.send_to(&query, proxy_addr).await.unwrap();

    let mut buf = vec![0u8; 512];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = &buf[..n];

    assert_eq!(&response[0..2], &[0xAB, 0xCD]);
    assert!(response[2] & 0x80 != 0);
    assert!(response.ends_with(&[127, 0, 0, 42]));

    upstream_task.await.unwrap();
    cancel.cancel();
}
