//! Renewal scheduler: the per-path state machine.
//!
//! ```text
//! Idle -> Authenticating -> Fetching -> Committing -> Scheduled -> Idle
//!              \________________\____________\
//!                                             -> ErrorBackoff -> Authenticating
//! ```
//!
//! [`RenewalScheduler::run_cycle`] performs one pass and never sleeps;
//! [`RenewalScheduler::run`] owns the waiting between passes.

use crate::config::RenewalPolicy;
use crate::error::{CommitError, FetchError, RevokeError};
use crate::lease::CredentialLease;
use crate::metrics::RenewalMetrics;
use crate::provider::{LeaseSource, TokenSource};
use crate::secrets::CredentialSet;
use crate::sink::{Ack, ConfigSink};
use crate::tracker::LeaseTracker;
use parking_lot::Mutex;
use rust_common::retry::jitter_up_to;
use rust_common::{RetryConfig, RetryPolicy};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

const REVOKE_ATTEMPTS: u32 = 2;

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Waiting for the next check
    Idle,
    /// Obtaining a token
    Authenticating,
    /// Requesting a new lease
    Fetching,
    /// Applying the new credential set
    Committing,
    /// Renewed; next check stored
    Scheduled {
        /// When the current lease is next due
        next_check: Instant,
    },
    /// Waiting before the next attempt
    ErrorBackoff {
        /// Consecutive failed cycles
        attempt: u32,
        /// When the next attempt starts
        retry_at: Instant,
    },
    /// Permission failures reached the ceiling; waiting for a manual trigger
    Stalled,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Authenticating => "authenticating",
            Self::Fetching => "fetching",
            Self::Committing => "committing",
            Self::Scheduled { .. } => "scheduled",
            Self::ErrorBackoff { .. } => "error_backoff",
            Self::Stalled => "stalled",
        };
        f.write_str(s)
    }
}

/// Result of one renewal pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A new lease is current
    Renewed {
        /// The new lease
        lease_id: String,
        /// When it is next due
        next_check: Instant,
    },
    /// The pass failed and will be retried
    Failed {
        /// When to retry
        retry_at: Instant,
    },
    /// Renewal stopped on repeated permission failures
    Stalled,
    /// Shutdown arrived mid-pass
    Cancelled,
    /// Another renewal of the same path holds the tracker
    InProgress,
}

/// Snapshot published after every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalStatus {
    /// Credential path
    pub path: String,
    /// Current state
    pub state: SchedulerState,
    /// Consecutive failed cycles
    pub attempt: u32,
    /// Consecutive permission failures
    pub consecutive_forbidden: u32,
    /// Whether renewal is stalled
    pub stalled: bool,
    /// Current lease id
    pub current_lease: Option<String>,
    /// Next scheduled pass
    pub next_check: Option<Instant>,
    /// Most recent failure
    pub last_error: Option<String>,
}

impl RenewalStatus {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            state: SchedulerState::Idle,
            attempt: 0,
            consecutive_forbidden: 0,
            stalled: false,
            current_lease: None,
            next_check: None,
            last_error: None,
        }
    }
}

enum Wake {
    Shutdown,
    Trigger,
    Timer,
}

/// Renewal state machine for one credential path.
pub struct RenewalScheduler {
    path: String,
    tokens: Arc<dyn TokenSource>,
    leases: Arc<dyn LeaseSource>,
    sink: Arc<dyn ConfigSink>,
    tracker: Arc<Mutex<LeaseTracker>>,
    policy: RenewalPolicy,
    backoff: RetryPolicy,
    revoke_retry: RetryPolicy,
    metrics: Arc<RenewalMetrics>,
    trigger: Arc<Notify>,
    status_tx: watch::Sender<RenewalStatus>,
    state: SchedulerState,
    attempt: u32,
    consecutive_forbidden: u32,
    next_cycle: Option<Instant>,
    last_error: Option<String>,
    revocations: VecDeque<(Instant, String)>,
}

impl RenewalScheduler {
    /// Create a scheduler for `path`.
    #[must_use]
    pub fn new(
        path: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        leases: Arc<dyn LeaseSource>,
        sink: Arc<dyn ConfigSink>,
        policy: RenewalPolicy,
    ) -> Self {
        let path = path.into();
        let backoff = RetryPolicy::new(
            RetryConfig::default()
                .with_initial_delay(policy.base_backoff)
                .with_max_delay(policy.max_retry_backoff)
                .with_jitter(policy.jitter_range),
        );
        let revoke_retry = RetryPolicy::new(
            RetryConfig::default()
                .with_max_retries(REVOKE_ATTEMPTS)
                .with_initial_delay(policy.base_backoff)
                .with_max_delay(policy.base_backoff * 4)
                .with_jitter(Duration::ZERO),
        );
        let (status_tx, _) = watch::channel(RenewalStatus::new(&path));

        Self {
            tracker: Arc::new(Mutex::new(LeaseTracker::new(path.clone()))),
            path,
            tokens,
            leases,
            sink,
            policy,
            backoff,
            revoke_retry,
            metrics: Arc::new(RenewalMetrics::new()),
            trigger: Arc::new(Notify::new()),
            status_tx,
            state: SchedulerState::Idle,
            attempt: 0,
            consecutive_forbidden: 0,
            next_cycle: None,
            last_error: None,
            revocations: VecDeque::new(),
        }
    }

    /// Share `metrics` with other schedulers.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<RenewalMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Credential path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The lease tracker, shared with observers.
    #[must_use]
    pub fn tracker(&self) -> Arc<Mutex<LeaseTracker>> {
        Arc::clone(&self.tracker)
    }

    /// Counters this scheduler reports to.
    #[must_use]
    pub fn metrics(&self) -> Arc<RenewalMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Manual trigger: notifying it starts a pass immediately.
    #[must_use]
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    /// Subscribe to status snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RenewalStatus> {
        self.status_tx.subscribe()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SchedulerState {
        self.state
    }

    /// Consecutive failed cycles.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Consecutive permission failures.
    #[must_use]
    pub const fn consecutive_forbidden(&self) -> u32 {
        self.consecutive_forbidden
    }

    /// Superseded leases still waiting out their grace window.
    #[must_use]
    pub fn pending_revocations(&self) -> usize {
        self.revocations.len()
    }

    /// Run one renewal pass.
    ///
    /// Returns early with [`CycleOutcome::Cancelled`] once `shutdown`
    /// turns `true`; a lease fetched but not committed is revoked first.
    pub async fn run_cycle(&mut self, shutdown: &mut watch::Receiver<bool>) -> CycleOutcome {
        let span = info_span!("renewal_cycle", path = %self.path, cycle_id = %Uuid::new_v4());
        self.cycle(shutdown).instrument(span).await
    }

    async fn cycle(&mut self, shutdown: &mut watch::Receiver<bool>) -> CycleOutcome {
        if self.state == SchedulerState::Stalled {
            debug!("Renewal stalled; waiting for a manual trigger");
            return CycleOutcome::Stalled;
        }

        if let Err(e) = self.tracker.lock().begin_renewal() {
            warn!(error = %e, "Renewal rejected");
            self.next_cycle = Some(Instant::now() + self.policy.min_check_interval);
            return CycleOutcome::InProgress;
        }

        let outcome = self.renew(shutdown).await;

        let orphan = self.tracker.lock().finish_renewal();
        if let Some(lease) = orphan {
            // Abandoned mid-commit: the sink may already hold it.
            self.discard(&lease.lease_id, true).await;
        }

        if outcome == CycleOutcome::Cancelled {
            self.set_state(SchedulerState::Idle);
        }
        outcome
    }

    async fn renew(&mut self, shutdown: &mut watch::Receiver<bool>) -> CycleOutcome {
        self.set_state(SchedulerState::Authenticating);
        let token = match cancellable(shutdown, self.tokens.token()).await {
            None => return CycleOutcome::Cancelled,
            Some(Err(e)) => return self.fail(format!("authenticate: {e}")),
            Some(Ok(token)) => token,
        };

        self.set_state(SchedulerState::Fetching);
        let lease = match cancellable(shutdown, self.leases.fetch(&token, &self.path)).await {
            None => return CycleOutcome::Cancelled,
            Some(Err(e @ FetchError::Forbidden { .. })) => return self.on_forbidden(&e.to_string()),
            Some(Err(e)) => return self.fail(format!("fetch: {e}")),
            Some(Ok(lease)) => lease,
        };
        self.consecutive_forbidden = 0;

        let new_id = lease.lease_id.clone();
        let credentials = lease.data.clone();
        let recorded = {
            let mut tracker = self.tracker.lock();
            let old_id = tracker.current().map(|c| c.lease_id.clone());
            tracker.record(lease).map(|()| old_id)
        };
        let old_id = match recorded {
            Ok(old_id) => old_id,
            Err(e) => {
                self.revoke_best_effort(&new_id).await;
                return self.fail(format!("record: {e}"));
            }
        };

        self.set_state(SchedulerState::Committing);
        let committed = match self.commit_with_retry(shutdown, &credentials).await {
            None => return CycleOutcome::Cancelled,
            Some(result) => result,
        };

        // The flag tells whether the sink may hold the new credentials.
        let swap = match committed {
            Err(e) => Err((
                format!("commit: {e}"),
                matches!(e, CommitError::Unreachable(_)),
            )),
            Ok(ack) => self
                .tracker
                .lock()
                .supersede(old_id.as_deref(), &new_id)
                .map(|superseded| (ack, superseded))
                .map_err(|e| (format!("supersede: {e}"), true)),
        };

        match swap {
            Ok((ack, superseded)) => self.on_renewed(&new_id, ack, superseded).await,
            Err((reason, maybe_applied)) => {
                if let Err(e) = self.tracker.lock().rollback(&new_id) {
                    error!(error = %e, "Rollback found no pending lease");
                }
                self.discard(&new_id, maybe_applied).await;
                self.fail(reason)
            }
        }
    }

    /// `None` when cancelled.
    async fn commit_with_retry(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        credentials: &CredentialSet,
    ) -> Option<Result<Ack, CommitError>> {
        let mut tries = 0;
        loop {
            let result = cancellable(shutdown, self.commit(credentials)).await?;
            match result {
                Err(e) if tries < self.policy.commit_retries => {
                    warn!(error = %e, "Commit failed; retrying with the same lease");
                    tries += 1;
                }
                other => return Some(other),
            }
        }
    }

    async fn commit(&self, credentials: &CredentialSet) -> Result<Ack, CommitError> {
        match tokio::time::timeout(self.policy.commit_timeout, self.sink.commit(credentials)).await {
            Ok(result) => result,
            Err(_) => Err(CommitError::Unreachable(format!(
                "no acknowledgement within {}s",
                self.policy.commit_timeout.as_secs()
            ))),
        }
    }

    async fn on_renewed(
        &mut self,
        lease_id: &str,
        ack: Ack,
        superseded: Option<CredentialLease>,
    ) -> CycleOutcome {
        if let Some(old) = superseded {
            if self.policy.revoke_grace.is_zero() {
                self.revoke_best_effort(&old.lease_id).await;
            } else {
                debug!(lease_id = %old.lease_id, grace_secs = self.policy.revoke_grace.as_secs(), "Superseded lease queued for revocation");
                self.revocations
                    .push_back((Instant::now() + self.policy.revoke_grace, old.lease_id));
            }
        }

        let time_to_renew = self
            .tracker
            .lock()
            .current_time_to_renew(&self.policy)
            .unwrap_or_default();
        let delay = time_to_renew
            .saturating_sub(jitter_up_to(self.policy.jitter_range))
            .max(self.policy.min_check_interval);
        let next_check = Instant::now() + delay;

        self.metrics.renewals.inc();
        self.attempt = 0;
        self.last_error = None;
        self.next_cycle = Some(next_check);
        self.set_state(SchedulerState::Scheduled { next_check });

        info!(lease_id, ?ack, next_check_secs = delay.as_secs(), "Credentials renewed");
        CycleOutcome::Renewed {
            lease_id: lease_id.to_string(),
            next_check,
        }
    }

    fn fail(&mut self, reason: String) -> CycleOutcome {
        let delay = self.backoff.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        let retry_at = Instant::now() + delay;

        warn!(attempt = self.attempt, retry_in_ms = delay.as_millis(), error = %reason, "Renewal failed");
        self.metrics.failures.inc();
        self.last_error = Some(reason);
        self.next_cycle = Some(retry_at);
        self.set_state(SchedulerState::ErrorBackoff {
            attempt: self.attempt,
            retry_at,
        });
        CycleOutcome::Failed { retry_at }
    }

    fn on_forbidden(&mut self, reason: &str) -> CycleOutcome {
        self.tokens.invalidate();
        self.consecutive_forbidden = self.consecutive_forbidden.saturating_add(1);

        if self.consecutive_forbidden < self.policy.forbidden_ceiling {
            return self.fail(format!("fetch: {reason}"));
        }

        error!(
            consecutive_forbidden = self.consecutive_forbidden,
            "Permission denied repeatedly; renewal stalled until manually triggered"
        );
        self.metrics.failures.inc();
        self.metrics.stalled.inc();
        self.last_error = Some(format!("stalled: {reason}"));
        self.next_cycle = None;
        self.set_state(SchedulerState::Stalled);
        CycleOutcome::Stalled
    }

    /// Leave the stalled state and reset the failure counters.
    pub fn clear_stall(&mut self) {
        if self.state != SchedulerState::Stalled {
            return;
        }
        info!(path = %self.path, "Clearing stalled renewal");
        self.metrics.stalled.dec();
        self.consecutive_forbidden = 0;
        self.attempt = 0;
        self.next_cycle = Some(Instant::now());
        self.set_state(SchedulerState::Idle);
    }

    /// Retire a lease that did not become current.
    ///
    /// When the sink may hold its credentials, the current lease's set is
    /// committed again before revoking; if that fails too the lease is left
    /// to expire rather than revoked under a live consumer.
    async fn discard(&self, lease_id: &str, maybe_applied: bool) {
        if maybe_applied && !self.restore_current().await {
            self.metrics.revocation_failures.inc();
            warn!(lease_id, "Sink may still hold this lease; leaving it to expire");
            return;
        }
        self.revoke_best_effort(lease_id).await;
    }

    /// `true` once the sink acknowledged the current lease's credentials,
    /// or when there is no current lease to put back.
    async fn restore_current(&self) -> bool {
        let current = self.tracker.lock().current().map(|c| c.data.clone());
        let Some(credentials) = current else {
            return true;
        };
        match self.commit(&credentials).await {
            Ok(ack) => {
                info!(?ack, "Current credentials restored to the sink");
                true
            }
            Err(e) => {
                warn!(error = %e, "Restoring current credentials failed");
                false
            }
        }
    }

    async fn revoke_best_effort(&self, lease_id: &str) {
        let tokens = &self.tokens;
        let leases = &self.leases;
        let result = self
            .revoke_retry
            .execute(|| async move {
                let token = tokens
                    .token()
                    .await
                    .map_err(|e| RevokeError::Unreachable(e.to_string()))?;
                leases.revoke(&token, lease_id).await
            })
            .await;

        match result {
            Ok(()) => {
                self.metrics.revocations.inc();
                info!(lease_id, "Lease revoked");
            }
            Err(e) => {
                self.metrics.revocation_failures.inc();
                warn!(lease_id, error = %e, "Lease revocation failed; it will expire on its own");
            }
        }
    }

    async fn revoke_due(&mut self, now: Instant) {
        while self.revocations.front().is_some_and(|(due, _)| *due <= now) {
            if let Some((_, lease_id)) = self.revocations.pop_front() {
                self.revoke_best_effort(&lease_id).await;
            }
        }
    }

    /// Earliest instant at which the loop has something to do.
    fn next_wake(&self) -> Option<Instant> {
        let expiry = self
            .tracker
            .lock()
            .current()
            .map(CredentialLease::expires_at);
        let revocation = self.revocations.front().map(|(due, _)| *due);
        [self.next_cycle, expiry, revocation].into_iter().flatten().min()
    }

    /// Revoke due leases and expire the current one if its TTL ran out.
    async fn on_timer(&mut self) {
        let now = Instant::now();
        self.revoke_due(now).await;

        let expired = self.tracker.lock().expire_elapsed(now);
        if let Some(lease_id) = expired {
            warn!(lease_id = %lease_id, "Lease expired before it was replaced");
            self.publish();
        }
    }

    /// Drive renewals until `shutdown` turns `true`.
    ///
    /// The first pass starts immediately. Superseded leases still in their
    /// grace window are revoked before returning; the current lease is left
    /// in place for its consumers.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(path = %self.path, "Renewal scheduler started");
        let trigger = Arc::clone(&self.trigger);
        self.next_cycle = Some(Instant::now());

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.next_cycle.is_some_and(|at| at <= Instant::now()) {
                if self.run_cycle(&mut shutdown).await == CycleOutcome::Cancelled {
                    break;
                }
                if matches!(self.state, SchedulerState::Scheduled { .. }) {
                    self.set_state(SchedulerState::Idle);
                }
                continue;
            }

            let deadline = self.next_wake();
            let wake = tokio::select! {
                biased;
                () = shutdown_signalled(&mut shutdown) => Wake::Shutdown,
                () = trigger.notified() => Wake::Trigger,
                () = sleep_until_opt(deadline) => Wake::Timer,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Trigger => {
                    info!(path = %self.path, "Manual renewal triggered");
                    self.clear_stall();
                    self.next_cycle = Some(Instant::now());
                }
                Wake::Timer => self.on_timer().await,
            }
        }

        if !self.revocations.is_empty() {
            info!(count = self.revocations.len(), "Revoking superseded leases before exit");
        }
        while let Some((_, lease_id)) = self.revocations.pop_front() {
            self.revoke_best_effort(&lease_id).await;
        }
        info!(path = %self.path, "Renewal scheduler stopped");
    }

    fn set_state(&mut self, state: SchedulerState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Scheduler state change");
        }
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        let current_lease = self
            .tracker
            .lock()
            .current()
            .map(|c| c.lease_id.clone());
        let status = RenewalStatus {
            path: self.path.clone(),
            state: self.state,
            attempt: self.attempt,
            consecutive_forbidden: self.consecutive_forbidden,
            stalled: self.state == SchedulerState::Stalled,
            current_lease,
            next_check: self.next_cycle,
            last_error: self.last_error.clone(),
        };
        self.status_tx.send_replace(status);
    }
}

/// Resolves once `shutdown` is `true` or its sender is gone.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn cancellable<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = shutdown_signalled(shutdown) => None,
        out = fut => Some(out),
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
