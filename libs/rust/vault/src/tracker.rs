//! Lease tracker: the single-current-lease invariant for one credential path.
//!
//! At any instant the tracker holds at most one live (`Active` or
//! `Renewing`) lease and at most one `Pending` replacement. A pending lease
//! only becomes current through [`LeaseTracker::supersede`], which checks
//! every precondition before mutating anything.

use crate::config::RenewalPolicy;
use crate::error::TrackerError;
use crate::lease::{CredentialLease, LeaseState, time_to_renew_at};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const RETIRED_HISTORY: usize = 16;

/// Lease bookkeeping for a single credential path.
#[derive(Debug)]
pub struct LeaseTracker {
    path: String,
    current: Option<CredentialLease>,
    pending: Option<CredentialLease>,
    retired: VecDeque<CredentialLease>,
    renewal_in_flight: bool,
}

impl LeaseTracker {
    /// Create an empty tracker for `path`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            current: None,
            pending: None,
            retired: VecDeque::with_capacity(RETIRED_HISTORY),
            renewal_in_flight: false,
        }
    }

    /// Credential path this tracker guards.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The live lease, if any.
    #[must_use]
    pub fn current(&self) -> Option<&CredentialLease> {
        self.current.as_ref()
    }

    /// The recorded but not yet committed replacement, if any.
    #[must_use]
    pub fn pending(&self) -> Option<&CredentialLease> {
        self.pending.as_ref()
    }

    /// Recently superseded, rolled back or expired leases, oldest first.
    pub fn retired(&self) -> impl Iterator<Item = &CredentialLease> {
        self.retired.iter()
    }

    /// Number of live leases; never more than one.
    #[must_use]
    pub fn live_count(&self) -> usize {
        usize::from(self.current.as_ref().is_some_and(|l| l.state.is_live()))
            + usize::from(self.pending.as_ref().is_some_and(|l| l.state.is_live()))
    }

    /// Whether a renewal is in flight.
    #[must_use]
    pub const fn is_renewing(&self) -> bool {
        self.renewal_in_flight
    }

    /// Claim the right to renew this path.
    ///
    /// # Errors
    ///
    /// [`TrackerError::RenewalInProgress`] if another renewal holds the claim.
    pub fn begin_renewal(&mut self) -> Result<(), TrackerError> {
        if self.renewal_in_flight {
            return Err(TrackerError::RenewalInProgress {
                path: self.path.clone(),
            });
        }
        self.renewal_in_flight = true;
        if let Some(current) = self.current.as_mut() {
            current.state = LeaseState::Renewing;
        }
        Ok(())
    }

    /// Release the renewal claim.
    ///
    /// Returns a pending lease left behind by an abandoned renewal so the
    /// caller can revoke it.
    pub fn finish_renewal(&mut self) -> Option<CredentialLease> {
        self.renewal_in_flight = false;
        if let Some(current) = self.current.as_mut() {
            if current.state == LeaseState::Renewing {
                current.state = LeaseState::Active;
            }
        }
        let orphan = self.pending.take();
        if let Some(lease) = &orphan {
            warn!(path = %self.path, lease_id = %lease.lease_id, "Renewal finished with an uncommitted lease");
            self.retire(lease.clone(), LeaseState::Revoked);
        }
        orphan
    }

    /// Record a freshly fetched lease as the pending replacement.
    ///
    /// # Errors
    ///
    /// [`TrackerError::ConflictingCurrent`] if a replacement is already
    /// pending or the lease is already current.
    pub fn record(&mut self, mut lease: CredentialLease) -> Result<(), TrackerError> {
        if let Some(pending) = &self.pending {
            return Err(TrackerError::ConflictingCurrent {
                expected: None,
                found: Some(pending.lease_id.clone()),
            });
        }
        if self.current.as_ref().is_some_and(|c| c.lease_id == lease.lease_id) {
            return Err(TrackerError::ConflictingCurrent {
                expected: None,
                found: Some(lease.lease_id),
            });
        }

        debug!(path = %self.path, lease_id = %lease.lease_id, ttl_secs = lease.ttl.as_secs(), "Recorded pending lease");
        lease.state = LeaseState::Pending;
        self.pending = Some(lease);
        Ok(())
    }

    /// Promote the pending lease `new` to current and revoke `old`.
    ///
    /// `old` must name the current lease (`None` when there is none).
    /// Either both transitions happen or neither does. Returns the
    /// superseded lease.
    ///
    /// # Errors
    ///
    /// [`TrackerError::ConflictingCurrent`] if `old` is not current or `new`
    /// is not pending.
    pub fn supersede(
        &mut self,
        old: Option<&str>,
        new: &str,
    ) -> Result<Option<CredentialLease>, TrackerError> {
        let current_id = self.current.as_ref().map(|c| c.lease_id.as_str());
        if current_id != old {
            return Err(TrackerError::ConflictingCurrent {
                expected: old.map(str::to_string),
                found: current_id.map(str::to_string),
            });
        }
        let pending_id = self.pending.as_ref().map(|p| p.lease_id.as_str());
        if pending_id != Some(new) {
            return Err(TrackerError::ConflictingCurrent {
                expected: Some(new.to_string()),
                found: pending_id.map(str::to_string),
            });
        }

        let Some(mut promoted) = self.pending.take() else {
            return Err(TrackerError::UnknownLease(new.to_string()));
        };
        promoted.state = LeaseState::Active;

        let superseded = self.current.replace(promoted).map(|mut lease| {
            lease.state = LeaseState::Revoked;
            self.retire(lease.clone(), LeaseState::Revoked);
            lease
        });

        debug!(path = %self.path, new = %new, old = ?old, "Lease superseded");
        Ok(superseded)
    }

    /// Abandon the pending lease `new`; the current lease stays current.
    ///
    /// # Errors
    ///
    /// [`TrackerError::UnknownLease`] if `new` is not pending.
    pub fn rollback(&mut self, new: &str) -> Result<CredentialLease, TrackerError> {
        if self.pending.as_ref().map(|p| p.lease_id.as_str()) != Some(new) {
            return Err(TrackerError::UnknownLease(new.to_string()));
        }
        let Some(mut lease) = self.pending.take() else {
            return Err(TrackerError::UnknownLease(new.to_string()));
        };
        lease.state = LeaseState::Revoked;
        self.retire(lease.clone(), LeaseState::Revoked);
        if let Some(current) = self.current.as_mut() {
            current.state = if self.renewal_in_flight {
                LeaseState::Renewing
            } else {
                LeaseState::Active
            };
        }
        Ok(lease)
    }

    /// Mark a lease as naturally expired.
    ///
    /// # Errors
    ///
    /// [`TrackerError::UnknownLease`] if the tracker holds no such lease.
    pub fn expire(&mut self, lease_id: &str) -> Result<(), TrackerError> {
        if self.current.as_ref().is_some_and(|c| c.lease_id == lease_id) {
            if let Some(lease) = self.current.take() {
                self.retire(lease, LeaseState::Expired);
            }
            return Ok(());
        }
        if self.pending.as_ref().is_some_and(|p| p.lease_id == lease_id) {
            if let Some(lease) = self.pending.take() {
                self.retire(lease, LeaseState::Expired);
            }
            return Ok(());
        }
        Err(TrackerError::UnknownLease(lease_id.to_string()))
    }

    /// Expire the current lease if its TTL has run out at `now`.
    pub fn expire_elapsed(&mut self, now: Instant) -> Option<String> {
        let id = self
            .current
            .as_ref()
            .filter(|c| c.is_expired_at(now))
            .map(|c| c.lease_id.clone())?;
        self.expire(&id).ok()?;
        Some(id)
    }

    /// Time until `lease` is due for proactive renewal.
    #[must_use]
    pub fn time_to_renew(lease: &CredentialLease, policy: &RenewalPolicy) -> Duration {
        time_to_renew_at(lease, policy, Instant::now())
    }

    /// Time until the current lease is due; `None` without a current lease.
    #[must_use]
    pub fn current_time_to_renew(&self, policy: &RenewalPolicy) -> Option<Duration> {
        self.current.as_ref().map(|c| Self::time_to_renew(c, policy))
    }

    fn retire(&mut self, mut lease: CredentialLease, state: LeaseState) {
        lease.state = state;
        if self.retired.len() == RETIRED_HISTORY {
            self.retired.pop_front();
        }
        self.retired.push_back(lease);
    }
}
