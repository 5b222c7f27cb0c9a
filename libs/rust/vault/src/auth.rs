//! AppRole auth client with a cached token and single-flight refresh.
//!
//! Concurrent callers that find the cached token stale share one login
//! exchange instead of each hitting the auth endpoint.

use crate::config::{VaultConfig, api_url};
use crate::error::AuthError;
use crate::provider::TokenSource;
use crate::secrets::AuthResponse;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// A store token. `Debug` never prints the value.
#[derive(Clone)]
pub struct AuthToken {
    value: SecretString,
    /// When the token was received
    pub issued_at: Instant,
    /// Token TTL; zero means the token does not expire
    pub ttl: Duration,
    /// Whether the store allows renewing the token
    pub renewable: bool,
}

impl AuthToken {
    /// A token issued now.
    #[must_use]
    pub fn new(value: impl Into<String>, ttl: Duration, renewable: bool) -> Self {
        Self {
            value: SecretString::from(value.into()),
            issued_at: Instant::now(),
            ttl,
            renewable,
        }
    }

    /// Whether the token may still be used at `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: Instant) -> bool {
        self.ttl.is_zero() || now < self.issued_at + self.ttl
    }

    /// The raw token, for the auth header only.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .field("renewable", &self.renewable)
            .finish_non_exhaustive()
    }
}

type InflightLogin = Shared<BoxFuture<'static, Result<AuthToken, AuthError>>>;

/// Auth client holding the AppRole credentials and the cached token.
pub struct AuthClient {
    http: Client,
    login_url: String,
    role_id: String,
    secret_id: SecretString,
    cached: Arc<RwLock<Option<AuthToken>>>,
    inflight: Arc<Mutex<Option<InflightLogin>>>,
}

impl AuthClient {
    /// Create a client for the configured auth path.
    #[must_use]
    pub fn new(config: &VaultConfig, http: Client) -> Self {
        Self {
            http,
            login_url: api_url(&config.addr, &config.auth_path),
            role_id: config.role_id.clone(),
            secret_id: config.secret_id.clone(),
            cached: Arc::new(RwLock::new(None)),
            inflight: Arc::new(Mutex::new(None)),
        }
    }

    /// Exchange `role_id`/`secret_id` for a token and cache it.
    ///
    /// Performs exactly one request; retrying is left to the caller.
    ///
    /// # Errors
    ///
    /// [`AuthError::Unreachable`] on network failure or a 5xx/429 status,
    /// [`AuthError::InvalidResponse`] on any other failure status or a body
    /// without `auth.client_token`.
    pub async fn authenticate(
        &self,
        role_id: &str,
        secret_id: &SecretString,
    ) -> Result<AuthToken, AuthError> {
        let token = login(
            self.http.clone(),
            self.login_url.clone(),
            role_id.to_string(),
            secret_id.clone(),
        )
        .await?;
        *self.cached.write() = Some(token.clone());
        Ok(token)
    }

    /// The cached token if it is still valid at `now`.
    #[must_use]
    pub fn cached_token(&self) -> Option<AuthToken> {
        let now = Instant::now();
        self.cached
            .read()
            .as_ref()
            .filter(|t| t.is_valid_at(now))
            .cloned()
    }

    /// A valid token, logging in again when the cached one is stale.
    ///
    /// # Errors
    ///
    /// Propagates the login failure; see [`AuthClient::authenticate`].
    pub async fn token(&self) -> Result<AuthToken, AuthError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }
        self.refresh_single_flight().await
    }

    /// Drop the cached token.
    pub fn invalidate(&self) {
        if self.cached.write().take().is_some() {
            debug!("Cached token invalidated");
        }
    }

    /// Only one login request is made even if many callers find the token
    /// stale at once.
    async fn refresh_single_flight(&self) -> Result<AuthToken, AuthError> {
        let mut inflight_guard = self.inflight.lock().await;

        if let Some(fut) = inflight_guard.as_ref().filter(|f| f.peek().is_none()) {
            let fut = fut.clone();
            drop(inflight_guard);
            return fut.await;
        }

        // A login may have completed while this caller waited for the lock.
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let http = self.http.clone();
        let url = self.login_url.clone();
        let role_id = self.role_id.clone();
        let secret_id = self.secret_id.clone();
        let cached = Arc::clone(&self.cached);

        let fut: BoxFuture<'static, Result<AuthToken, AuthError>> = Box::pin(async move {
            let token = login(http, url, role_id, secret_id).await?;
            *cached.write() = Some(token.clone());
            Ok(token)
        });

        let shared_fut = fut.shared();
        *inflight_guard = Some(shared_fut.clone());
        drop(inflight_guard);

        let result = shared_fut.clone().await;
        clear_inflight(&mut *self.inflight.lock().await, &shared_fut);
        result
    }
}

#[async_trait]
impl TokenSource for AuthClient {
    async fn token(&self) -> Result<AuthToken, AuthError> {
        Self::token(self).await
    }

    fn invalidate(&self) {
        Self::invalidate(self);
    }
}

/// Empty the in-flight slot unless a newer login has taken it over.
fn clear_inflight(slot: &mut Option<InflightLogin>, finished: &InflightLogin) {
    if slot.as_ref().is_some_and(|f| f.ptr_eq(finished)) {
        *slot = None;
    }
}

#[instrument(skip_all, fields(url = %url))]
async fn login(
    http: Client,
    url: String,
    role_id: String,
    secret_id: SecretString,
) -> Result<AuthToken, AuthError> {
    let body = serde_json::json!({
        "role_id": role_id,
        "secret_id": secret_id.expose_secret(),
    });

    let response = http
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| AuthError::Unreachable(e.to_string()))?;

    let status = response.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        warn!(%status, "Auth endpoint unavailable");
        return Err(AuthError::Unreachable(format!("status {status}")));
    }
    if !status.is_success() {
        return Err(AuthError::InvalidResponse(format!("status {status}")));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| AuthError::Unreachable(e.to_string()))?;
    let parsed: AuthResponse = serde_json::from_slice(&bytes)
        .map_err(|_| AuthError::InvalidResponse("body is not valid JSON".to_string()))?;

    let auth = parsed
        .auth
        .ok_or_else(|| AuthError::InvalidResponse("missing auth block".to_string()))?;
    let value = auth
        .client_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::InvalidResponse("missing auth.client_token".to_string()))?;

    let ttl = auth
        .lease_duration
        .ok_or_else(|| AuthError::InvalidResponse("missing auth.lease_duration".to_string()))?;

    let token = AuthToken::new(value, Duration::from_secs(ttl), auth.renewable);
    info!(ttl_secs = token.ttl.as_secs(), policies = ?auth.policies, "Authenticated with Vault");
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_login(value: &'static str) -> InflightLogin {
        let fut: BoxFuture<'static, Result<AuthToken, AuthError>> =
            Box::pin(async move { Ok(AuthToken::new(value, Duration::ZERO, false)) });
        fut.shared()
    }

    #[test]
    fn test_finished_login_keeps_newer_inflight() {
        let finished = ready_login("old");
        let newer = ready_login("new");

        let mut slot = Some(newer.clone());
        clear_inflight(&mut slot, &finished);
        assert!(slot.as_ref().is_some_and(|f| f.ptr_eq(&newer)));

        clear_inflight(&mut slot, &newer);
        assert!(slot.is_none());
    }

    #[test]
    fn test_token_debug_redacts_value() {
        let token = AuthToken::new("hvs.very-secret", Duration::from_secs(60), true);
        let debug = format!("{token:?}");
        assert!(!debug.contains("hvs.very-secret"));
        assert!(debug.contains("[REDACTED]"));
        assert_eq!(token.expose(), "hvs.very-secret");
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_validity_window() {
        let token = AuthToken::new("t", Duration::from_secs(60), false);
        assert!(token.is_valid_at(token.issued_at + Duration::from_secs(59)));
        assert!(!token.is_valid_at(token.issued_at + Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_expires() {
        let token = AuthToken::new("root", Duration::ZERO, false);
        assert!(token.is_valid_at(token.issued_at + Duration::from_secs(86_400 * 365)));
    }
}
