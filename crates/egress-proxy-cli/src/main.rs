//! Process entry point: parse arguments, wire a policy document into a
//! `Supervisor`, and run it until `SIGINT`/`SIGTERM`.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sbx_egress_proxy::{EgressPolicy, PartialEgressPolicy, Supervisor};
use tokio_util::sync::CancellationToken;

/// Egress-filtering network proxy for a Linux microVM sandbox.
///
/// Enforces one ordered domain policy across an HTTP forward proxy, a
/// transparent TLS (SNI) proxy, and a DNS proxy.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Policy document: `{"default_policy":"allow"|"deny","rules":[...],
    /// "http_listen":"ADDR", "tls_listen":"ADDR", "dns_listen":"ADDR",
    /// "dns_upstream":"ADDR"}`.
    #[arg(long)]
    policy: String,

    /// Overrides/sets the HTTP listen address from the policy document.
    #[arg(long)]
    http_listen: Option<String>,

    /// Overrides/sets the TLS listen address from the policy document.
    #[arg(long)]
    tls_listen: Option<String>,

    /// Overrides/sets the DNS listen address from the policy document.
    #[arg(long)]
    dns_listen: Option<String>,

    /// Overrides the upstream DNS resolver address.
    #[arg(long)]
    dns_upstream: Option<String>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let policy = build_policy(&args).context("failed to build egress policy")?;
    let cancel = CancellationToken::new();

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            wait_for_shutdown_signal().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        }
    };

    let supervisor = Supervisor::new(policy);
    let (run_result, ()) = tokio::join!(supervisor.run(cancel), shutdown);
    run_result.context("egress supervisor failed")?;
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
        },
        LogFormat::Json => {
            tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
        },
    }
}

/// Parse the policy document, then apply any CLI overrides for the listen
/// addresses and upstream resolver. `--http-listen` may supply the HTTP
/// listen address entirely on its own, so the JSON document is allowed to
/// omit `http_listen` as long as the flag fills it in before validation.
fn build_policy(args: &Args) -> Result<EgressPolicy> {
    let mut policy =
        PartialEgressPolicy::from_json(&args.policy).context("invalid --policy document")?;

    if let Some(addr) = &args.http_listen {
        policy.http_listen = Some(addr.parse().context("invalid --http-listen address")?);
    }
    if let Some(addr) = &args.tls_listen {
        policy.tls_listen = Some(addr.parse().context("invalid --tls-listen address")?);
    }
    if let Some(addr) = &args.dns_listen {
        policy.dns_listen = Some(addr.parse().context("invalid --dns-listen address")?);
    }
    if let Some(addr) = &args.dns_upstream {
        policy.dns_upstream = Some(addr.parse().context("invalid --dns-upstream address")?);
    }

    policy.finish().context("invalid policy")
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler; watching SIGINT only");
                let _ = tokio::signal::ctrl_c().await;
            },
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn args(policy: &str) -> Args {
        Args {
            policy: policy.to_string(),
            http_listen: None,
            tls_listen: None,
            dns_listen: None,
            dns_upstream: None,
            log_format: LogFormat::Pretty,
        }
    }

    #[test]
    fn cli_http_listen_overrides_policy_document() {
        let mut a = args(r#"{"default_policy":"allow","http_listen":"127.0.0.1:9000"}"#);
        a.http_listen = Some("127.0.0.1:9100".to_string());
        let policy = build_policy(&a).unwrap();
        assert_eq!(policy.http_listen, "127.0.0.1:9100".parse().unwrap());
    }

    #[test]
    fn http_listen_supplied_only_via_flag() {
        let mut a = args(r#"{"default_policy":"allow"}"#);
        a.http_listen = Some("127.0.0.1:9200".to_string());
        let policy = build_policy(&a).unwrap();
        assert_eq!(policy.http_listen, "127.0.0.1:9200".parse().unwrap());
    }

    #[test]
    fn missing_http_listen_in_both_document_and_flags_is_rejected() {
        let a = args(r#"{"default_policy":"allow"}"#);
        assert!(build_policy(&a).is_err());
    }

    #[test]
    fn cli_tls_listen_colliding_with_http_listen_is_rejected() {
        let mut a = args(r#"{"default_policy":"allow","http_listen":"127.0.0.1:9000"}"#);
        a.tls_listen = Some("127.0.0.1:9000".to_string());
        assert!(build_policy(&a).is_err());
    }

    #[test]
    fn cli_dns_upstream_overrides_policy_document() {
        let mut a = args(r#"{"default_policy":"allow","http_listen":"127.0.0.1:9000"}"#);
        a.dns_upstream = Some("1.1.1.1:53".to_string());
        let policy = build_policy(&a).unwrap();
        assert_eq!(policy.dns_upstream, "1.1.1.1:53".parse().unwrap());
    }

    #[test]
    fn invalid_policy_document_is_rejected() {
        let a = args("not json");
        assert!(build_policy(&a).is_err());
    }
}
