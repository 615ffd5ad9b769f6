//! The policy and listener configuration shared by every component, plus the
//! `Dialer`/`Resolver` seams listeners dial/resolve through — concrete system
//! implementations by default, swappable for deterministic tests.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sbx_egress_policy::{Action, Matcher, Rule};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DNS_UPSTREAM: &str = "8.8.8.8:53";

/// Opens a TCP connection to a target. The system implementation is a plain
/// `TcpStream::connect` under a connect timeout; tests inject a fake that
/// points every dial at a loopback fixture.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: SocketAddr) -> std::io::Result<TcpStream>;
}

/// Resolves a hostname to its IP addresses. Used by the TLS proxy's
/// IP-overlap defense (§4.3) — injected so tests can supply deterministic
/// mappings without touching a real resolver.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup_host(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Dials with a fixed connect timeout via the system resolver + TCP stack.
pub struct SystemDialer {
    pub connect_timeout: Duration,
}

impl Default for SystemDialer {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            )),
        }
    }
}

/// Resolves via the system's async DNS lookup (`tokio::net::lookup_host`).
#[derive(Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_host(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// Immutable, per-listener configuration: where to listen, the shared
/// Matcher, and the Dialer/Resolver seams.
#[derive(Clone)]
pub struct ListenerConfig {
    pub listen_addr: SocketAddr,
    pub matcher: Arc<Matcher>,
    pub dialer: Arc<dyn Dialer>,
    pub resolver: Arc<dyn Resolver>,
}

impl ListenerConfig {
    #[must_use]
    pub fn new(listen_addr: SocketAddr, matcher: Arc<Matcher>) -> Self {
        Self {
            listen_addr,
            matcher,
            dialer: Arc::new(SystemDialer::default()),
            resolver: Arc::new(SystemResolver),
        }
    }

    #[must_use]
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

/// The top-level policy document: the rule set plus the set of listeners to
/// run. Built once by the CLI (or a test harness) and handed to the
/// Supervisor.
#[derive(Clone)]
pub struct EgressPolicy {
    pub matcher: Arc<Matcher>,
    pub http_listen: SocketAddr,
    pub tls_listen: Option<SocketAddr>,
    pub dns_listen: Option<SocketAddr>,
    pub dns_upstream: SocketAddr,
}

impl EgressPolicy {
    /// Build a policy from its constituent parts, validating the
    /// non-collision invariant from the data model: `tls_listen` and
    /// `dns_listen`, when present, must each differ from `http_listen`.
    pub fn new(
        default_policy: Action,
        rules: Vec<Rule>,
        http_listen: SocketAddr,
        tls_listen: Option<SocketAddr>,
        dns_listen: Option<SocketAddr>,
        dns_upstream: Option<SocketAddr>,
    ) -> Result<Self> {
        if tls_listen == Some(http_listen) {
            return Err(Error::ClientProtocol(format!(
                "tls_listen must differ from http_listen ({http_listen})"
            )));
        }
        if dns_listen == Some(http_listen) {
            return Err(Error::ClientProtocol(format!(
                "dns_listen must differ from http_listen ({http_listen})"
            )));
        }
        let dns_upstream = dns_upstream.unwrap_or_else(default_dns_upstream);
        Ok(Self {
            matcher: Arc::new(Matcher::new(default_policy, rules)),
            http_listen,
            tls_listen,
            dns_listen,
            dns_upstream,
        })
    }

    /// Parse from the wire JSON document described in the external
    /// interfaces: `{"default_policy": .., "rules": [..], "http_listen": ..,
    /// "tls_listen": .., "dns_listen": .., "dns_upstream": ..}`, requiring
    /// `http_listen` to be present in the document itself.
    pub fn from_json(text: &str) -> Result<Self> {
        PartialEgressPolicy::from_json(text)?.finish()
    }
}

/// A policy document parsed from JSON that may still be missing its HTTP
/// listen address. `EgressPolicy::from_json` requires `http_listen` to be
/// set in the document; a caller that instead lets a CLI flag supply it
/// parses with [`PartialEgressPolicy::from_json`], applies the override to
/// `http_listen`, then calls [`PartialEgressPolicy::finish`] to validate and
/// produce the final `EgressPolicy`.
pub struct PartialEgressPolicy {
    pub default_policy: Action,
    pub rules: Vec<Rule>,
    pub http_listen: Option<SocketAddr>,
    pub tls_listen: Option<SocketAddr>,
    pub dns_listen: Option<SocketAddr>,
    pub dns_upstream: Option<SocketAddr>,
}

impl PartialEgressPolicy {
    /// Parse the same wire JSON document `EgressPolicy::from_json` accepts,
    /// except `http_listen` is optional here — left `None` when the
    /// document omits it, for a CLI override to fill in before `finish`.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let obj = value.as_object().ok_or_else(|| {
            Error::Policy(sbx_egress_policy::Error::InvalidPolicy(
                "policy must be a JSON object".into(),
            ))
        })?;

        let default_policy = obj
            .get("default_policy")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                Error::Policy(sbx_egress_policy::Error::InvalidPolicy(
                    "missing `default_policy`".into(),
                ))
            })?;
        let default_policy = Action::parse_default_policy(default_policy)?;

        let rules = match obj.get("rules") {
            Some(value) => {
                let array = value.as_array().ok_or_else(|| {
                    Error::Policy(sbx_egress_policy::Error::InvalidPolicy(
                        "`rules` must be an array".into(),
                    ))
                })?;
                array
                    .iter()
                    .map(|r| {
                        let text = r.to_string();
                        sbx_egress_policy::parse_rule(&text).map_err(Error::Policy)
                    })
                    .collect::<Result<Vec<Rule>>>()?
            },
            None => Vec::new(),
        };

        let http_listen = obj
            .get("http_listen")
            .and_then(serde_json::Value::as_str)
            .map(parse_socket_addr)
            .transpose()?;

        let tls_listen = obj
            .get("tls_listen")
            .and_then(serde_json::Value::as_str)
            .map(parse_socket_addr)
            .transpose()?;

        let dns_listen = obj
            .get("dns_listen")
            .and_then(serde_json::Value::as_str)
            .map(parse_socket_addr)
            .transpose()?;

        let dns_upstream = obj
            .get("dns_upstream")
            .and_then(serde_json::Value::as_str)
            .map(parse_socket_addr)
            .transpose()?;

        Ok(Self { default_policy, rules, http_listen, tls_listen, dns_listen, dns_upstream })
    }

    /// Validate that `http_listen` has been set (by the document or a
    /// caller-applied override) and build the final `EgressPolicy`.
    pub fn finish(self) -> Result<EgressPolicy> {
        let http_listen = self.http_listen.ok_or_else(|| {
            Error::ClientProtocol(
                "missing `http_listen`: set it in the policy document or via --http-listen".into(),
            )
        })?;
        EgressPolicy::new(
            self.default_policy,
            self.rules,
            http_listen,
            self.tls_listen,
            self.dns_listen,
            self.dns_upstream,
        )
    }
}

fn default_dns_upstream() -> SocketAddr {
    DEFAULT_DNS_UPSTREAM
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([8, 8, 8, 8], 53)))
}

fn parse_socket_addr(s: &str) -> Result<SocketAddr> {
    s.parse().map_err(|_| {
        Error::Policy(sbx_egress_policy::Error::InvalidPolicy(format!(
            "invalid listen address `{s}`"
        )))
    })
}
