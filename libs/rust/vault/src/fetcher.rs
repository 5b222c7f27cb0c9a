//! Credential fetcher: dynamic credential issue, lease lookup and revocation.

use crate::auth::AuthToken;
use crate::config::{VaultConfig, api_url};
use crate::error::{FetchError, RevokeError};
use crate::lease::{CredentialLease, LeaseInfo};
use crate::provider::LeaseSource;
use crate::secrets::{CredentialSet, DynamicCredsResponse, LeaseLookupResponse, value_to_string};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";

/// HTTP client for the dynamic secret engine and the lease endpoints.
pub struct CredentialFetcher {
    http: Client,
    addr: Url,
    lookup_path: String,
    revoke_path: String,
}

impl CredentialFetcher {
    /// Create a fetcher sharing `http` with the rest of the engine.
    #[must_use]
    pub fn new(config: &VaultConfig, http: Client) -> Self {
        Self {
            http,
            addr: config.addr.clone(),
            lookup_path: config.lease_lookup_path.clone(),
            revoke_path: config.revoke_path.clone(),
        }
    }

    /// Issue a new credential lease from `path`.
    ///
    /// # Errors
    ///
    /// [`FetchError::Forbidden`] on 403, [`FetchError::Unreachable`] on
    /// network failure or a 5xx/429 status, [`FetchError::Malformed`] when
    /// the body lacks `data`, `lease_id` or `lease_duration`.
    #[instrument(skip(self, token))]
    pub async fn fetch(&self, token: &AuthToken, path: &str) -> Result<CredentialLease, FetchError> {
        let response = self
            .http
            .get(api_url(&self.addr, path))
            .header(VAULT_TOKEN_HEADER, token.expose())
            .send()
            .await
            .map_err(|e| FetchError::unreachable(e.to_string()))?;

        let body: DynamicCredsResponse = read_json(response, path).await?;

        let data = body
            .data
            .filter(|d| !d.is_empty())
            .ok_or_else(|| FetchError::malformed(path, "data"))?;
        let lease_id = body
            .lease_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| FetchError::malformed(path, "lease_id"))?;
        let lease_duration = body
            .lease_duration
            .ok_or_else(|| FetchError::malformed(path, "lease_duration"))?;

        let credentials: CredentialSet = data
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect();

        let fields: Vec<&str> = credentials.keys().collect();
        debug!(lease_id = %lease_id, ttl_secs = lease_duration, ?fields, "Fetched dynamic credentials");

        Ok(CredentialLease::new(
            lease_id,
            credentials,
            Duration::from_secs(lease_duration),
            body.renewable,
        ))
    }

    /// Revoke a lease in the store. One request, no retry.
    ///
    /// # Errors
    ///
    /// [`RevokeError::Forbidden`] on 403, [`RevokeError::Unreachable`] on
    /// network failure or a 5xx/429 status, [`RevokeError::Rejected`] for
    /// any other failure status.
    #[instrument(skip(self, token))]
    pub async fn revoke(&self, token: &AuthToken, lease_id: &str) -> Result<(), RevokeError> {
        let response = self
            .http
            .put(api_url(&self.addr, &self.revoke_path))
            .header(VAULT_TOKEN_HEADER, token.expose())
            .json(&serde_json::json!({ "lease_id": lease_id }))
            .send()
            .await
            .map_err(|e| RevokeError::Unreachable(e.to_string()))?;

        let status = response.status();
        match status {
            s if s.is_success() => {
                debug!(lease_id, "Lease revoked");
                Ok(())
            }
            s if s == StatusCode::FORBIDDEN => Err(RevokeError::Forbidden(lease_id.to_string())),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Err(RevokeError::Unreachable(format!("status {s}")))
            }
            s => Err(RevokeError::Rejected(s.as_u16())),
        }
    }

    /// Look a lease up in the store.
    ///
    /// # Errors
    ///
    /// Same classification as [`CredentialFetcher::fetch`]; a body without
    /// `data` is [`FetchError::Malformed`].
    #[instrument(skip(self, token))]
    pub async fn lookup(&self, token: &AuthToken, lease_id: &str) -> Result<LeaseInfo, FetchError> {
        let response = self
            .http
            .put(api_url(&self.addr, &self.lookup_path))
            .header(VAULT_TOKEN_HEADER, token.expose())
            .json(&serde_json::json!({ "lease_id": lease_id }))
            .send()
            .await
            .map_err(|e| FetchError::unreachable(e.to_string()))?;

        let body: LeaseLookupResponse = read_json(response, &self.lookup_path).await?;
        let data = body
            .data
            .ok_or_else(|| FetchError::malformed(&self.lookup_path, "data"))?;

        Ok(LeaseInfo {
            lease_id: data.id,
            ttl: Duration::from_secs(data.ttl),
            renewable: data.renewable,
            expire_time: data.expire_time.as_deref().and_then(parse_time),
            issue_time: data.issue_time.as_deref().and_then(parse_time),
        })
    }
}

#[async_trait]
impl LeaseSource for CredentialFetcher {
    async fn fetch(&self, token: &AuthToken, path: &str) -> Result<CredentialLease, FetchError> {
        Self::fetch(self, token, path).await
    }

    async fn revoke(&self, token: &AuthToken, lease_id: &str) -> Result<(), RevokeError> {
        Self::revoke(self, token, lease_id).await
    }

    async fn lookup(&self, token: &AuthToken, lease_id: &str) -> Result<LeaseInfo, FetchError> {
        Self::lookup(self, token, lease_id).await
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: Response,
    path: &str,
) -> Result<T, FetchError> {
    let status = response.status();
    match status {
        s if s == StatusCode::FORBIDDEN => {
            return Err(FetchError::Forbidden {
                path: path.to_string(),
            });
        }
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            return Err(FetchError::unreachable(format!("status {s}")));
        }
        s if !s.is_success() => return Err(FetchError::malformed(path, "status")),
        _ => {}
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| FetchError::unreachable(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|_| FetchError::malformed(path, "body"))
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
