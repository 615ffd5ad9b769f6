use thiserror::Error;

/// Crate-level error type. The abstract error kinds from the design ("Timeout",
/// "ShutdownTimeout") are not separate variants here: `tokio::time::timeout`
/// already surfaces a uniform elapsed error at the call site, folded into
/// whichever of `ClientProtocol`/`UpstreamDial` applies to that direction.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Policy(#[from] sbx_egress_policy::Error),

    #[error("failed to bind {addr}: {source}")]
    BindError {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    #[error("upstream dial failed: {0}")]
    UpstreamDial(String),
}

pub type Result<T> = std::result::Result<T, Error>;
