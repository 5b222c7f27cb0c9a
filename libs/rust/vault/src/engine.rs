//! Engine front end: one shared token cache, one scheduler task per path.

use crate::auth::AuthClient;
use crate::config::VaultConfig;
use crate::error::{EngineError, FetchError, TrackerError};
use crate::fetcher::CredentialFetcher;
use crate::lease::{CredentialLease, LeaseInfo};
use crate::metrics::RenewalMetrics;
use crate::provider::{LeaseSource, TokenSource};
use crate::scheduler::{RenewalScheduler, RenewalStatus};
use crate::sink::ConfigSink;
use crate::tracker::LeaseTracker;
use parking_lot::Mutex;
use rust_common::{HttpConfig, PlatformError, build_http_client};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Renewal engine for any number of credential paths.
pub struct RenewalEngine {
    config: VaultConfig,
    tokens: Arc<dyn TokenSource>,
    leases: Arc<dyn LeaseSource>,
    metrics: Arc<RenewalMetrics>,
    running: Arc<Mutex<HashSet<String>>>,
}

impl RenewalEngine {
    /// Build an engine talking to the configured Vault.
    ///
    /// # Errors
    ///
    /// [`EngineError::Config`] for an invalid configuration,
    /// [`EngineError::Platform`] if the HTTP client cannot be built.
    pub fn new(config: &VaultConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let http = build_http_client(&HttpConfig::default().with_timeout(config.request_timeout))?;

        let auth = Arc::new(AuthClient::new(config, http.clone()));
        let fetcher = Arc::new(CredentialFetcher::new(config, http));

        info!(addr = %config.addr, auth_path = %config.auth_path, "Renewal engine ready");
        Ok(Self::with_sources(config.clone(), auth, fetcher))
    }

    /// Build an engine over arbitrary token and lease sources.
    #[must_use]
    pub fn with_sources(
        config: VaultConfig,
        tokens: Arc<dyn TokenSource>,
        leases: Arc<dyn LeaseSource>,
    ) -> Self {
        Self {
            config,
            tokens,
            leases,
            metrics: Arc::new(RenewalMetrics::new()),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Metrics shared by every scheduler of this engine.
    #[must_use]
    pub fn metrics(&self) -> Arc<RenewalMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Paths with a running scheduler.
    #[must_use]
    pub fn running_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.running.lock().iter().cloned().collect();
        paths.sort();
        paths
    }

    /// Start renewing the configured credential path.
    ///
    /// # Errors
    ///
    /// See [`RenewalEngine::spawn`].
    pub fn spawn_default(&self, sink: Arc<dyn ConfigSink>) -> Result<RenewalHandle, TrackerError> {
        let path = self.config.credential_path.clone();
        self.spawn(&path, sink)
    }

    /// Start renewing `path` into `sink` on a new task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`TrackerError::RenewalInProgress`] if `path` already has a scheduler.
    pub fn spawn(&self, path: &str, sink: Arc<dyn ConfigSink>) -> Result<RenewalHandle, TrackerError> {
        if !self.running.lock().insert(path.to_string()) {
            return Err(TrackerError::RenewalInProgress {
                path: path.to_string(),
            });
        }

        let scheduler = RenewalScheduler::new(
            path,
            Arc::clone(&self.tokens),
            Arc::clone(&self.leases),
            sink,
            self.config.policy.clone(),
        )
        .with_metrics(Arc::clone(&self.metrics));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = scheduler.subscribe();
        let tracker = scheduler.tracker();
        let trigger = scheduler.trigger();

        let registration = Registration {
            running: Arc::clone(&self.running),
            path: path.to_string(),
        };
        let task = tokio::spawn(async move {
            let _registration = registration;
            scheduler.run(shutdown_rx).await;
        });

        Ok(RenewalHandle {
            path: path.to_string(),
            status,
            tracker,
            trigger,
            metrics: Arc::clone(&self.metrics),
            shutdown_tx,
            task,
        })
    }

    /// Ask the store about a lease.
    ///
    /// # Errors
    ///
    /// [`FetchError`] from the lookup; an auth failure is reported as
    /// [`FetchError::Unreachable`].
    pub async fn lookup(&self, lease_id: &str) -> Result<LeaseInfo, FetchError> {
        let token = self
            .tokens
            .token()
            .await
            .map_err(|e| FetchError::unreachable(format!("authenticate: {e}")))?;
        self.leases.lookup(&token, lease_id).await
    }
}

/// Frees the path when the scheduler task ends or is aborted.
struct Registration {
    running: Arc<Mutex<HashSet<String>>>,
    path: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.running.lock().remove(&self.path);
    }
}

/// Control handle for one running scheduler.
///
/// Dropping the handle stops the scheduler.
pub struct RenewalHandle {
    path: String,
    status: watch::Receiver<RenewalStatus>,
    tracker: Arc<Mutex<LeaseTracker>>,
    trigger: Arc<Notify>,
    metrics: Arc<RenewalMetrics>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RenewalHandle {
    /// Credential path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Start a renewal pass now; also clears a stalled state.
    pub fn renew_now(&self) {
        self.trigger.notify_one();
    }

    /// Latest status snapshot.
    #[must_use]
    pub fn status(&self) -> RenewalStatus {
        self.status.borrow().clone()
    }

    /// Receiver for status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RenewalStatus> {
        self.status.clone()
    }

    /// The live lease, if any.
    #[must_use]
    pub fn current_lease(&self) -> Option<CredentialLease> {
        self.tracker.lock().current().cloned()
    }

    /// Engine metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<RenewalMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Stop the scheduler and wait up to `timeout` for it to finish.
    ///
    /// # Errors
    ///
    /// [`PlatformError::Timeout`] if the task had to be aborted,
    /// [`PlatformError::Internal`] if it panicked.
    pub async fn shutdown(self, timeout: Duration) -> Result<(), PlatformError> {
        self.shutdown_tx.send_replace(true);
        let abort = self.task.abort_handle();

        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => {
                info!(path = %self.path, "Renewal stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(PlatformError::internal(format!("scheduler task failed: {e}"))),
            Err(_) => {
                warn!(path = %self.path, timeout_secs = timeout.as_secs(), "Scheduler did not stop in time; aborting");
                abort.abort();
                Err(PlatformError::Timeout(format!("scheduler for {}", self.path)))
            }
        }
    }
}
