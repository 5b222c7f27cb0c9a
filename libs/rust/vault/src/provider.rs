//! Secret store seams.
//!
//! The scheduler talks to the store only through these traits, so it can be
//! driven by any backend that issues tokens and leases.

use crate::auth::AuthToken;
use crate::error::{AuthError, FetchError, RevokeError};
use crate::lease::{CredentialLease, LeaseInfo};
use async_trait::async_trait;

/// Source of store tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A valid token, re-authenticating when the cached one has expired.
    async fn token(&self) -> Result<AuthToken, AuthError>;

    /// Drop any cached token so the next call re-authenticates.
    fn invalidate(&self);
}

/// Source of dynamic credential leases.
#[async_trait]
pub trait LeaseSource: Send + Sync {
    /// Issue a new credential lease for `path`.
    async fn fetch(&self, token: &AuthToken, path: &str) -> Result<CredentialLease, FetchError>;

    /// Revoke a lease in the store.
    async fn revoke(&self, token: &AuthToken, lease_id: &str) -> Result<(), RevokeError>;

    /// Ask the store about a lease.
    async fn lookup(&self, token: &AuthToken, lease_id: &str) -> Result<LeaseInfo, FetchError>;
}
