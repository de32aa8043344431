use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use console_client::{ClientFacade, EtcdConnector, RetryPolicy};
use console_cluster::BackupCatalog;
use console_core::OpContext;
use console_core::config::ConsoleConfig;
use console_core::options::parse_timeout;

/// Resolved configuration plus the root cancellation token of one invocation.
pub struct Session {
    pub config: ConsoleConfig,
    timeout: Option<String>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(config: ConsoleConfig, timeout: Option<String>) -> Self {
        Self {
            config,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancel every pending operation on Ctrl-C.
    pub fn cancel_on_interrupt(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    /// `--timeout` if it parses, otherwise `default`.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        parse_timeout(self.timeout.as_deref(), default)
    }

    pub fn request_ctx(&self) -> OpContext {
        self.ctx(self.timeout_or(self.config.timeouts.request()))
    }

    pub fn ctx(&self, timeout: Duration) -> OpContext {
        OpContext::with_parent(&self.cancel, timeout)
    }

    pub async fn connect(&self) -> anyhow::Result<ClientFacade> {
        let timeouts = &self.config.timeouts;
        let connector = Arc::new(EtcdConnector::new(timeouts.dial(), timeouts.request())?);
        let policy = RetryPolicy {
            backoff: timeouts.reconnect_backoff(),
        };
        let facade =
            ClientFacade::connect(connector, &self.config.console.endpoints, policy, &self.cancel)
                .await?;
        Ok(facade)
    }

    pub fn catalog(&self) -> BackupCatalog {
        BackupCatalog::new(
            PathBuf::from(&self.config.console.backup_dir),
            self.config.console.scratch_dir(),
        )
    }
}
