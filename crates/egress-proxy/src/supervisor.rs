//! Egress Supervisor: owns the lifecycles of the listeners an [`EgressPolicy`]
//! configures, under one shared cancellation signal. The first listener
//! failure cancels the rest; an external cancel stops all of them.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::EgressPolicy;
use crate::dns::DnsProxy;
use crate::error::Result;
use crate::http::HttpProxy;
use crate::tls::TlsProxy;

/// Runs every listener an [`EgressPolicy`] names (HTTP always, TLS/DNS when
/// configured) concurrently under a shared [`CancellationToken`].
pub struct Supervisor {
    policy: EgressPolicy,
}

impl Supervisor {
    #[must_use]
    pub fn new(policy: EgressPolicy) -> Self {
        Self { policy }
    }

    /// Run until either a listener fails (returned as `Err`, having already
    /// cancelled its siblings) or `cancel` fires externally, in which case
    /// every listener is given its own grace budget to drain before this
    /// returns `Ok(())`.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let matcher = Arc::clone(&self.policy.matcher);
        let mut tasks = tokio::task::JoinSet::new();

        let http_config = crate::config::ListenerConfig::new(self.policy.http_listen, Arc::clone(&matcher));
        spawn_listener(&mut tasks, "http", cancel.clone(), {
            let cancel = cancel.clone();
            async move { HttpProxy::new(http_config).run(cancel).await }
        });

        if let Some(tls_listen) = self.policy.tls_listen {
            let tls_config = crate::config::ListenerConfig::new(tls_listen, Arc::clone(&matcher));
            spawn_listener(&mut tasks, "tls", cancel.clone(), {
                let cancel = cancel.clone();
                async move { TlsProxy::new(tls_config).run(cancel).await }
            });
        }

        if let Some(dns_listen) = self.policy.dns_listen {
            let dns_config = crate::config::ListenerConfig::new(dns_listen, Arc::clone(&matcher));
            let dns_upstream = self.policy.dns_upstream;
            spawn_listener(&mut tasks, "dns", cancel.clone(), {
                let cancel = cancel.clone();
                async move { DnsProxy::new(dns_config, dns_upstream).run(cancel).await }
            });
        }

        let mut first_error = None;
        while let Some(outcome) = tasks.join_next().await {
            match outcome {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    error!(error = %e, "listener failed; cancelling the rest");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    cancel.cancel();
                },
                Err(join_err) => {
                    error!(error = %join_err, "listener task panicked; cancelling the rest");
                    cancel.cancel();
                },
            }
        }

        info!("egress supervisor stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn spawn_listener<F>(tasks: &mut tokio::task::JoinSet<Result<()>>, name: &'static str, cancel: CancellationToken, fut: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    info!(listener = name, "starting listener");
    tasks.spawn(async move {
        let result = fut.await;
        if result.is_err() {
            cancel.cancel();
        }
        result
    });
}
