//! Ordered domain-rule matcher shared by the egress proxy's HTTP, TLS, and
//! DNS listeners.
//!
//! A [`Matcher`] is built once from a [`Rule`] list and a default
//! [`Action`], then shared read-only across every listener task. Domains
//! seen on the wire — a `Host` header, a TLS SNI value, a DNS QNAME — are
//! normalized with [`normalize`] before being evaluated.

mod error;
mod matcher;
mod normalize;
mod rule;

pub use error::{Error, Result};
pub use matcher::Matcher;
pub use normalize::normalize;
pub use rule::{parse_rule, Action, Rule};
