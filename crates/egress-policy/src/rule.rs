//! The [`Action`]/[`Rule`] data model and the `parse_rule` wire contract:
//! one rule per JSON object, `{"action":"allow"|"deny","domain":"<pattern>"}`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The two outcomes a [`crate::Matcher`] can return. A closed set — there is
/// no "maybe" at the data-model level; approval flows belong to a different
/// kind of proxy than this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

impl Action {
    /// Parse a `default_policy` config value. Fails with
    /// [`Error::InvalidPolicy`] for anything but `"allow"`/`"deny"`.
    pub fn parse_default_policy(s: &str) -> Result<Self> {
        match s {
            "allow" => Ok(Action::Allow),
            "deny" => Ok(Action::Deny),
            other => Err(Error::InvalidPolicy(format!(
                "default_policy must be \"allow\" or \"deny\", got `{other}`"
            ))),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Allow => write!(f, "allow"),
            Action::Deny => write!(f, "deny"),
        }
    }
}

/// One rule: an action plus the domain pattern it applies to. `domain` is
/// kept in its original (unparsed, unlowered) form here — the
/// [`crate::Matcher`] compiles it into a branch-free matching shape once at
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub action: Action,
    pub domain: String,
}

/// Parse one rule from its serialized form. Fails with
/// [`Error::InvalidRule`] when the text is not a JSON object, `action` is
/// absent or not `"allow"`/`"deny"`, or `domain` is absent or empty.
pub fn parse_rule(text: &str) -> Result<Rule> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let obj = value
        .as_object()
        .ok_or_else(|| Error::InvalidRule("rule must be a JSON object".into()))?;

    let action = obj
        .get("action")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::InvalidRule("missing `action`".into()))?;
    let action = match action {
        "allow" => Action::Allow,
        "deny" => Action::Deny,
        other => {
            return Err(Error::InvalidRule(format!(
                "action must be \"allow\" or \"deny\", got `{other}`"
            )));
        },
    };

    let domain = obj
        .get("domain")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::InvalidRule("missing `domain`".into()))?;
    if domain.is_empty() {
        return Err(Error::InvalidRule("`domain` must not be empty".into()));
    }

    Ok(Rule {
        action,
        domain: domain.to_string(),
    })
}
