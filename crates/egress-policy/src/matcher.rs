//! The compiled [`Matcher`]: an ordered list of rules plus a default policy.
//!
//! Each rule's domain is compiled once, at construction, into a
//! [`DomainSpec`] — `Any` / `Suffix` / `Exact` — so the hot-path lookup in
//! [`Matcher::action_for`] never re-parses a pattern string.

use crate::normalize::normalize;
use crate::rule::{Action, Rule};

#[derive(Debug, Clone)]
enum DomainSpec {
    /// `*` — matches every non-empty domain.
    Any,
    /// `*.X` — matches `Y.X` for any non-empty `Y`, never the bare `X`.
    Suffix(String),
    /// Anything else — case-insensitive exact match.
    Exact(String),
}

impl DomainSpec {
    fn compile(domain: &str) -> Self {
        let lowered = domain.trim().to_ascii_lowercase();
        if lowered == "*" {
            DomainSpec::Any
        } else if let Some(suffix) = lowered.strip_prefix("*.") {
            DomainSpec::Suffix(suffix.to_string())
        } else {
            DomainSpec::Exact(lowered)
        }
    }

    fn matches(&self, domain: &str) -> bool {
        match self {
            DomainSpec::Any => !domain.is_empty(),
            DomainSpec::Exact(exact) => domain == exact,
            DomainSpec::Suffix(suffix) => {
                domain.len() > suffix.len() + 1
                    && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.'
                    && domain.ends_with(suffix.as_str())
            },
        }
    }

    /// True for rule domains that are neither `*` nor `*.X` — the shape
    /// `denied_domains()` exposes for TLS defense-in-depth.
    fn as_non_wildcard_domain(&self) -> Option<&str> {
        match self {
            DomainSpec::Exact(d) => Some(d.as_str()),
            DomainSpec::Any | DomainSpec::Suffix(_) => None,
        }
    }
}

struct CompiledRule {
    action: Action,
    spec: DomainSpec,
}

/// An ordered, immutable policy: a compiled rule list plus a default
/// [`Action`]. Construction is the only fallible step (there is none, today
/// — `Action` is a closed enum — but the type stays in the API so callers at
/// the JSON boundary route through [`Action::parse_default_policy`]
/// uniformly). Matching is pure and safe to share across every listener
/// without locking.
pub struct Matcher {
    rules: Vec<CompiledRule>,
    default_policy: Action,
}

impl Matcher {
    #[must_use]
    pub fn new(default_policy: Action, rules: Vec<Rule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|r| CompiledRule {
                action: r.action,
                spec: DomainSpec::compile(&r.domain),
            })
            .collect();
        Self {
            rules,
            default_policy,
        }
    }

    /// Normalize `domain_raw` and evaluate it against the ordered rule list;
    /// the first matching rule wins, otherwise the default policy applies.
    #[must_use]
    pub fn action_for(&self, domain_raw: &str) -> Action {
        let domain = normalize(domain_raw);
        for rule in &self.rules {
            if rule.spec.matches(&domain) {
                return rule.action;
            }
        }
        self.default_policy
    }

    #[must_use]
    pub fn default_policy(&self) -> Action {
        self.default_policy
    }

    /// Lowercased domains `D` with an explicit `{Deny, D}` rule where `D` is
    /// neither `*` nor `*.X` — used by the TLS proxy's IP-overlap and
    /// certificate-SAN defense-in-depth checks.
    #[must_use]
    pub fn denied_domains(&self) -> Vec<String> {
        self.rules
            .iter()
            .filter(|r| r.action == Action::Deny)
            .filter_map(|r| r.spec.as_non_wildcard_domain())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn matcher(default_policy: Action, rules: &[(Action, &str)]) -> Matcher {
        let rules = rules
            .iter()
            .map(|(action, domain)| Rule {
                action: *action,
                domain: (*domain).to_string(),
            })
            .collect();
        Matcher::new(default_policy, rules)
    }

    #[test]
    fn first_match_wins() {
        let m = matcher(Action::Deny, &[
            (Action::Deny, "evil.com"),
            (Action::Allow, "*"),
        ]);
        assert_eq!(m.action_for("evil.com"), Action::Deny);
        assert_eq!(m.action_for("anything-else.org"), Action::Allow);
    }

    #[test]
    fn no_match_falls_back_to_default() {
        let m = matcher(Action::Deny, &[(Action::Allow, "*.github.com")]);
        assert_eq!(m.action_for("unrelated.org"), Action::Deny);
    }

    #[rstest]
    #[case("*.github.com", "api.github.com", true)]
    #[case("*.github.com", "deep.nested.github.com", true)]
    #[case("*.github.com", "github.com", false)] // wildcard never matches the bare domain
    #[case("*.github.com", "notgithub.com", false)]
    #[case("*.github.com", "evilgithub.com", false)]
    #[case("github.com", "github.com", true)]
    #[case("github.com", "api.github.com", false)]
    #[case("GitHub.COM", "github.com", true)] // rule domains are case-insensitive too
    #[case("*", "anything.org", true)]
    fn wildcard_semantics(#[case] pattern: &str, #[case] domain: &str, #[case] expect_allow: bool) {
        let m = matcher(Action::Deny, &[(Action::Allow, pattern)]);
        let expected = if expect_allow { Action::Allow } else { Action::Deny };
        assert_eq!(m.action_for(domain), expected);
    }

    #[test]
    fn star_matches_every_non_empty_domain() {
        let m = matcher(Action::Deny, &[(Action::Deny, "*")]);
        assert_eq!(m.action_for("anything.test"), Action::Deny);
        assert_eq!(m.action_for("x"), Action::Deny);
    }

    #[test]
    fn empty_domain_ip_literal_uses_default_policy() {
        let m = matcher(Action::Allow, &[(Action::Deny, "*")]);
        // An IP literal normalizes to "", which `*` (Any) explicitly excludes.
        assert_eq!(m.action_for("127.0.0.1"), Action::Allow);
    }

    #[test]
    fn preceding_rule_can_shadow_a_later_deny_star() {
        let m = matcher(Action::Allow, &[
            (Action::Allow, "*.example.com"),
            (Action::Deny, "*"),
        ]);
        assert_eq!(m.action_for("api.example.com"), Action::Allow);
        assert_eq!(m.action_for("other.test"), Action::Deny);
    }

    #[test]
    fn match_is_pure_and_repeatable() {
        let m = matcher(Action::Deny, &[(Action::Allow, "*.example.com")]);
        for _ in 0..5 {
            assert_eq!(m.action_for("api.example.com"), Action::Allow);
        }
    }

    #[test]
    fn denied_domains_excludes_wildcards_and_allows() {
        let m = matcher(Action::Allow, &[
            (Action::Deny, "blocked.test"),
            (Action::Deny, "*.evil.net"),
            (Action::Deny, "*"),
            (Action::Allow, "good.test"),
            (Action::Deny, "Also-Blocked.Test"),
        ]);
        let mut denied = m.denied_domains();
        denied.sort();
        assert_eq!(denied, vec!["also-blocked.test", "blocked.test"]);
    }

    #[test]
    fn denied_domains_empty_when_no_exact_denies() {
        let m = matcher(Action::Deny, &[(Action::Allow, "*.github.com")]);
        assert!(m.denied_domains().is_empty());
    }

    #[test]
    fn normalization_applied_before_matching() {
        let m = matcher(Action::Deny, &[(Action::Allow, "github.com")]);
        assert_eq!(m.action_for("GitHub.com."), Action::Allow);
        assert_eq!(m.action_for("  github.com  "), Action::Allow);
    }

    #[test]
    fn default_policy_accessor() {
        let m = matcher(Action::Allow, &[]);
        assert_eq!(m.default_policy(), Action::Allow);
    }
}
