//! Scripted in-memory test doubles for the store seams and the sink.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use vault_renewal::{
    Ack, AuthError, AuthToken, CommitError, ConfigSink, CredentialLease, CredentialSet, FetchError,
    LeaseInfo, LeaseSource, RenewalPolicy, RevokeError, TokenSource,
};

pub const PATH: &str = "database/creds/wp-app";

/// Policy without jitter so timing is exact.
pub fn exact_policy() -> RenewalPolicy {
    RenewalPolicy::default()
        .with_jitter_range(Duration::ZERO)
        .with_backoff(Duration::from_secs(1), Duration::from_secs(300))
        .with_revoke_grace(Duration::ZERO)
}

#[derive(Default)]
pub struct MockTokens {
    script: Mutex<VecDeque<AuthError>>,
    pub calls: AtomicUsize,
    pub invalidations: AtomicUsize,
}

impl MockTokens {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = AuthError>) {
        self.script.lock().extend(errors);
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for MockTokens {
    async fn token(&self) -> Result<AuthToken, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(AuthToken::new("test-token", Duration::from_secs(3600), true)),
        }
    }

    fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

/// Issues `lease-1`, `lease-2`, ... unless a scripted error is queued.
pub struct MockLeases {
    ttl: Duration,
    script: Mutex<VecDeque<FetchError>>,
    issued: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub revoked: Mutex<Vec<String>>,
    revoke_failures: Mutex<VecDeque<RevokeError>>,
}

impl MockLeases {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            script: Mutex::new(VecDeque::new()),
            issued: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            revoked: Mutex::new(Vec::new()),
            revoke_failures: Mutex::new(VecDeque::new()),
        })
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = FetchError>) {
        self.script.lock().extend(errors);
    }

    pub fn fail_revokes(&self, errors: impl IntoIterator<Item = RevokeError>) {
        self.revoke_failures.lock().extend(errors);
    }

    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaseSource for MockLeases {
    async fn fetch(&self, _token: &AuthToken, path: &str) -> Result<CredentialLease, FetchError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.script.lock().pop_front() {
            return Err(err);
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let data = CredentialSet::new()
            .with("username", format!("v-approle-{n}"))
            .with("password", format!("secret-{n}"));
        Ok(CredentialLease::new(format!("{path}/lease-{n}"), data, self.ttl, true))
    }

    async fn revoke(&self, _token: &AuthToken, lease_id: &str) -> Result<(), RevokeError> {
        if let Some(err) = self.revoke_failures.lock().pop_front() {
            return Err(err);
        }
        self.revoked.lock().push(lease_id.to_string());
        Ok(())
    }

    async fn lookup(&self, _token: &AuthToken, lease_id: &str) -> Result<LeaseInfo, FetchError> {
        Ok(LeaseInfo {
            lease_id: lease_id.to_string(),
            ttl: self.ttl,
            renewable: true,
            expire_time: None,
            issue_time: None,
        })
    }
}

/// Records every commit; scripted errors are returned first.
#[derive(Default)]
pub struct MockSink {
    script: Mutex<VecDeque<CommitError>>,
    delay: Mutex<Option<Duration>>,
    delays: Mutex<VecDeque<Duration>>,
    pub commits: Mutex<Vec<CredentialSet>>,
}

impl MockSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = CommitError>) {
        self.script.lock().extend(errors);
    }

    pub fn delay_by(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Delay only the next `count` commits.
    pub fn delay_next(&self, count: usize, delay: Duration) {
        self.delays.lock().extend(std::iter::repeat_n(delay, count));
    }

    pub fn commit_count(&self) -> usize {
        self.commits.lock().len()
    }

    pub fn last_username(&self) -> Option<String> {
        self.commits
            .lock()
            .last()
            .and_then(|c| c.get("username").map(str::to_string))
    }
}

#[async_trait]
impl ConfigSink for MockSink {
    async fn commit(&self, credentials: &CredentialSet) -> Result<Ack, CommitError> {
        let next = self.delays.lock().pop_front();
        let delay = next.or(*self.delay.lock());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.commits.lock().push(credentials.clone());
        match self.script.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(Ack::Applied),
        }
    }
}

pub fn lease_id(n: usize) -> String {
    format!("{PATH}/lease-{n}")
}
