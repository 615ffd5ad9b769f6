//! The three egress listeners (HTTP forward proxy, transparent TLS proxy,
//! DNS proxy) and the Supervisor that runs them under one shared
//! cancellation signal.

mod config;
mod dns;
mod error;
mod http;
mod io;
mod supervisor;
mod tls;

pub use config::{
    Dialer, EgressPolicy, ListenerConfig, PartialEgressPolicy, Resolver, SystemDialer,
    SystemResolver,
};
pub use dns::DnsProxy;
pub use error::{Error, Result};
pub use http::HttpProxy;
pub use io::{tunnel, TunnelOutcome, GRACEFUL_SHUTDOWN};
pub use supervisor::Supervisor;
pub use tls::TlsProxy;
