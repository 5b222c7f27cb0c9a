//! Credential leases and renewal timing.

use crate::config::RenewalPolicy;
use crate::secrets::CredentialSet;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle of a lease as seen by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Fetched and recorded, not yet committed to the sink
    Pending,
    /// Current and served to consumers
    Active,
    /// Current, with a replacement in flight
    Renewing,
    /// Reached its natural end of life
    Expired,
    /// Superseded or rolled back
    Revoked,
}

impl LeaseState {
    /// Whether consumers may still be using this lease.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::Renewing)
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Renewing => "renewing",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        };
        f.write_str(s)
    }
}

/// A dynamic credential together with its lease.
#[derive(Clone)]
pub struct CredentialLease {
    /// Store-assigned lease id, unique
    pub lease_id: String,
    /// Credential fields
    pub data: CredentialSet,
    /// TTL granted at issuance
    pub ttl: Duration,
    /// When this engine received the lease
    pub issued_at: Instant,
    /// Whether the store allows extending the lease
    pub renewable: bool,
    /// Lifecycle state
    pub state: LeaseState,
}

impl CredentialLease {
    /// A freshly fetched lease: `state = Active`, `issued_at = now`.
    #[must_use]
    pub fn new(lease_id: impl Into<String>, data: CredentialSet, ttl: Duration, renewable: bool) -> Self {
        Self {
            lease_id: lease_id.into(),
            data,
            ttl,
            issued_at: Instant::now(),
            renewable,
            state: LeaseState::Active,
        }
    }

    /// Instant at which the lease naturally expires.
    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.ttl
    }

    /// Remaining validity at `now`.
    #[must_use]
    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.expires_at().saturating_duration_since(now)
    }

    /// Whether the lease has run out at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }
}

impl fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialLease")
            .field("lease_id", &self.lease_id)
            .field("data", &self.data)
            .field("ttl", &self.ttl)
            .field("renewable", &self.renewable)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Time until `lease` should be proactively replaced, evaluated at `now`.
///
/// `remaining = ttl - (now - issued_at)`; renewal is due once
/// `remaining < min_ttl_fraction * ttl`, so this reaches zero at
/// `issued_at + (1 - min_ttl_fraction) * ttl`.
#[must_use]
pub fn time_to_renew_at(lease: &CredentialLease, policy: &RenewalPolicy, now: Instant) -> Duration {
    let threshold = lease.ttl.mul_f64(policy.min_ttl_fraction.clamp(0.0, 1.0));
    lease.remaining_at(now).saturating_sub(threshold)
}

/// Server-side view of a lease from the lookup endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    /// Lease id
    pub lease_id: String,
    /// Remaining TTL
    pub ttl: Duration,
    /// Whether the lease may be renewed
    pub renewable: bool,
    /// Absolute expiry, if reported
    pub expire_time: Option<DateTime<Utc>>,
    /// Absolute issue time, if reported
    pub issue_time: Option<DateTime<Utc>>,
}
