use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn json_error_converts() {
        let json_err = serde_json::from_str::<String>("not-json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn invalid_rule_message() {
        let err = Error::InvalidRule("missing `domain`".into());
        assert_eq!(err.to_string(), "invalid rule: missing `domain`");
    }
}
