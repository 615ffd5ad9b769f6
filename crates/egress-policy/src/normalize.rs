//! Domain normalization shared by every listener before a domain reaches the
//! [`crate::Matcher`].
//!
//! Trims whitespace, lowercases ASCII, strips exactly one trailing `.` (FQDN
//! form), and strips a trailing port (bracketed or not). If what remains
//! parses as an IPv4 or IPv6 literal the result is the empty string — an
//! unidentifiable domain that matches no rule but the default policy.

use std::net::IpAddr;

/// Normalize a raw domain as extracted from a `Host` header, SNI, or DNS
/// QNAME. Idempotent: `normalize(normalize(d)) == normalize(d)`.
#[must_use]
pub fn normalize(domain_raw: &str) -> String {
    let lowered = domain_raw.trim().to_ascii_lowercase();
    let without_dot = lowered.strip_suffix('.').unwrap_or(&lowered);
    let host = strip_port(without_dot);
    if is_ip_literal(host) {
        String::new()
    } else {
        host.to_string()
    }
}

/// Strip a trailing `:port`, tolerating a bracketed IPv6 literal
/// (`[::1]:8080`) and leaving bare IPv6 literals (`::1`, two or more
/// colons, no brackets) untouched — they carry no port to strip.
fn strip_port(s: &str) -> &str {
    if let Some(rest) = s.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => s,
        };
    }
    if s.matches(':').count() == 1 {
        if let Some((host, port)) = s.rsplit_once(':') {
            if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
                return host;
            }
        }
    }
    s
}

fn is_ip_literal(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok()
}
