//! Vault client and renewal policy configuration.

use crate::error::ConfigError;
use secrecy::SecretString;
use std::time::Duration;
use url::Url;

const DEFAULT_ADDR: &str = "https://127.0.0.1:8200";
const DEFAULT_CREDENTIAL_PATH: &str = "database/creds/wp-app";
const DEFAULT_AUTH_PATH: &str = "auth/approle/login";
const DEFAULT_LEASE_LOOKUP_PATH: &str = "sys/leases/lookup";
const DEFAULT_REVOKE_PATH: &str = "sys/leases/revoke";

/// Renewal timing policy. Immutable once an engine is built.
#[derive(Debug, Clone, PartialEq)]
pub struct RenewalPolicy {
    /// Renew when remaining TTL drops below this fraction of the issued TTL
    pub min_ttl_fraction: f64,
    /// Upper bound of the random jitter applied to checks and backoff
    pub jitter_range: Duration,
    /// Backoff for the first failed attempt
    pub base_backoff: Duration,
    /// Cap on the exponential part of the backoff
    pub max_retry_backoff: Duration,
    /// Consecutive permission failures before renewal is reported stalled
    pub forbidden_ceiling: u32,
    /// Commit retries with the same lease before it is revoked
    pub commit_retries: u32,
    /// How long a superseded lease stays valid in the store
    pub revoke_grace: Duration,
    /// Timeout for a single sink commit
    pub commit_timeout: Duration,
    /// Floor for the interval between two checks
    pub min_check_interval: Duration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            min_ttl_fraction: 0.25,
            jitter_range: Duration::from_secs(5),
            base_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(300),
            forbidden_ceiling: 5,
            commit_retries: 1,
            revoke_grace: Duration::from_secs(30),
            commit_timeout: Duration::from_secs(10),
            min_check_interval: Duration::from_secs(1),
        }
    }
}

impl RenewalPolicy {
    /// Set the renewal threshold fraction.
    #[must_use]
    pub const fn with_min_ttl_fraction(mut self, fraction: f64) -> Self {
        self.min_ttl_fraction = fraction;
        self
    }

    /// Set the jitter range.
    #[must_use]
    pub const fn with_jitter_range(mut self, jitter: Duration) -> Self {
        self.jitter_range = jitter;
        self
    }

    /// Set base and max backoff.
    #[must_use]
    pub const fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_retry_backoff = max;
        self
    }

    /// Set the consecutive-forbidden ceiling.
    #[must_use]
    pub const fn with_forbidden_ceiling(mut self, ceiling: u32) -> Self {
        self.forbidden_ceiling = ceiling;
        self
    }

    /// Set the revocation grace window for superseded leases.
    #[must_use]
    pub const fn with_revoke_grace(mut self, grace: Duration) -> Self {
        self.revoke_grace = grace;
        self
    }

    /// Set the sink commit timeout.
    #[must_use]
    pub const fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    /// Validate ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPolicy`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.min_ttl_fraction > 0.0 && self.min_ttl_fraction < 1.0) {
            return Err(ConfigError::InvalidPolicy(format!(
                "min_ttl_fraction must be in (0, 1), got {}",
                self.min_ttl_fraction
            )));
        }
        if self.base_backoff.is_zero() {
            return Err(ConfigError::InvalidPolicy(
                "base_backoff must be greater than 0".to_string(),
            ));
        }
        if self.max_retry_backoff < self.base_backoff {
            return Err(ConfigError::InvalidPolicy(
                "max_retry_backoff must not be below base_backoff".to_string(),
            ));
        }
        if self.forbidden_ceiling == 0 {
            return Err(ConfigError::InvalidPolicy(
                "forbidden_ceiling must be at least 1".to_string(),
            ));
        }
        if self.commit_timeout.is_zero() {
            return Err(ConfigError::InvalidPolicy(
                "commit_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Vault connection and AppRole configuration.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Vault server address
    pub addr: Url,
    /// AppRole role id
    pub role_id: String,
    /// AppRole secret id
    pub secret_id: SecretString,
    /// Dynamic credential path
    pub credential_path: String,
    /// Auth exchange path
    pub auth_path: String,
    /// Lease lookup path
    pub lease_lookup_path: String,
    /// Lease revocation path
    pub revoke_path: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Debug logging
    pub debug: bool,
    /// Renewal policy
    pub policy: RenewalPolicy,
}

impl VaultConfig {
    /// Create a configuration with defaults for everything but the address and AppRole credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUrl`] if `addr` does not parse.
    pub fn new(
        addr: &str,
        role_id: impl Into<String>,
        secret_id: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            addr: parse_url("VAULT_ADDR", addr)?,
            role_id: role_id.into(),
            secret_id: SecretString::from(secret_id.into()),
            credential_path: DEFAULT_CREDENTIAL_PATH.to_string(),
            auth_path: DEFAULT_AUTH_PATH.to_string(),
            lease_lookup_path: DEFAULT_LEASE_LOOKUP_PATH.to_string(),
            revoke_path: DEFAULT_REVOKE_PATH.to_string(),
            request_timeout: Duration::from_secs(10),
            debug: true,
            policy: RenewalPolicy::default(),
        })
    }

    /// Loads configuration from environment variables with validation.
    ///
    /// # Errors
    ///
    /// See [`VaultConfig::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for a missing role or secret id, an
    /// unparsable value, or a policy out of range.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str, default: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingRequired(name.to_string()))
        };

        let defaults = RenewalPolicy::default();
        let policy = RenewalPolicy {
            min_ttl_fraction: parse_var(&lookup, "VAULT_MIN_TTL_FRACTION", defaults.min_ttl_fraction)?,
            jitter_range: parse_secs(&lookup, "VAULT_RENEW_JITTER", defaults.jitter_range)?,
            base_backoff: parse_secs(&lookup, "VAULT_BASE_BACKOFF", defaults.base_backoff)?,
            max_retry_backoff: parse_secs(&lookup, "VAULT_MAX_RETRY_BACKOFF", defaults.max_retry_backoff)?,
            forbidden_ceiling: parse_var(&lookup, "VAULT_FORBIDDEN_CEILING", defaults.forbidden_ceiling)?,
            revoke_grace: parse_secs(&lookup, "VAULT_REVOKE_GRACE", defaults.revoke_grace)?,
            commit_timeout: parse_secs(&lookup, "VAULT_COMMIT_TIMEOUT", defaults.commit_timeout)?,
            ..defaults
        };

        let config = Self {
            addr: parse_url("VAULT_ADDR", &get("VAULT_ADDR", DEFAULT_ADDR))?,
            role_id: required("VAULT_ROLE_ID")?,
            secret_id: SecretString::from(required("VAULT_SECRET_ID")?),
            credential_path: get("VAULT_DB_PATH", DEFAULT_CREDENTIAL_PATH),
            auth_path: get("VAULT_TOKEN_PATH", DEFAULT_AUTH_PATH),
            lease_lookup_path: get("VAULT_LEASE_PATH", DEFAULT_LEASE_LOOKUP_PATH),
            revoke_path: get("VAULT_REVOKE_PATH", DEFAULT_REVOKE_PATH),
            request_timeout: parse_secs(&lookup, "VAULT_REQUEST_TIMEOUT", Duration::from_secs(10))?,
            debug: parse_flag(&lookup, "VAULT_DEBUG", true)?,
            policy,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.role_id.is_empty() {
            return Err(ConfigError::MissingRequired("role_id".to_string()));
        }
        if self.credential_path.trim_matches('/').is_empty() {
            return Err(ConfigError::MissingRequired("credential_path".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ParseError {
                name: "VAULT_REQUEST_TIMEOUT".to_string(),
                reason: "timeout must be greater than 0".to_string(),
            });
        }
        self.policy.validate()
    }

    /// Absolute URL for an API path under `/v1/`.
    #[must_use]
    pub fn api_url(&self, path: &str) -> String {
        api_url(&self.addr, path)
    }

    /// Replace the renewal policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RenewalPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the credential path.
    #[must_use]
    pub fn with_credential_path(mut self, path: impl Into<String>) -> Self {
        self.credential_path = path.into();
        self
    }
}

pub(crate) fn api_url(addr: &Url, path: &str) -> String {
    format!(
        "{}/v1/{}",
        addr.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn parse_url(field: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

/// Parse `name` through `lookup`, falling back to `default` when unset or blank.
///
/// # Errors
///
/// [`ConfigError::ParseError`] if the value does not parse as `T`.
pub fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(val) if !val.trim().is_empty() => {
            val.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
                name: name.to_string(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

/// Parse `name` as whole seconds.
///
/// # Errors
///
/// See [`parse_var`].
pub fn parse_secs<F>(lookup: &F, name: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_var(lookup, name, default.as_secs()).map(Duration::from_secs)
}

/// Parse `name` as a boolean flag (`1/0`, `true/false`, `yes/no`, `on/off`).
///
/// # Errors
///
/// [`ConfigError::ParseError`] for any other value.
pub fn parse_flag<F>(lookup: &F, name: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::ParseError {
                name: name.to_string(),
                reason: format!("not a boolean: {other}"),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_from_lookup() {
        let config = VaultConfig::from_lookup(lookup_from(&[
            ("VAULT_ROLE_ID", "role"),
            ("VAULT_SECRET_ID", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.addr.as_str(), "https://127.0.0.1:8200/");
        assert_eq!(config.credential_path, "database/creds/wp-app");
        assert_eq!(config.auth_path, "auth/approle/login");
        assert_eq!(config.lease_lookup_path, "sys/leases/lookup");
        assert!(config.debug);
        assert_eq!(config.policy, RenewalPolicy::default());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let config = VaultConfig::from_lookup(lookup_from(&[
            ("VAULT_ADDR", "http://vault:8200"),
            ("VAULT_ROLE_ID", "role"),
            ("VAULT_SECRET_ID", "secret"),
            ("VAULT_DB_PATH", "database/creds/reporting"),
            ("VAULT_DEBUG", "false"),
            ("VAULT_MIN_TTL_FRACTION", "0.5"),
            ("VAULT_MAX_RETRY_BACKOFF", "60"),
        ]))
        .unwrap();

        assert_eq!(config.credential_path, "database/creds/reporting");
        assert!(!config.debug);
        assert!((config.policy.min_ttl_fraction - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.policy.max_retry_backoff, Duration::from_secs(60));
        assert_eq!(config.api_url("auth/approle/login"), "http://vault:8200/v1/auth/approle/login");
    }

    #[test]
    fn test_missing_role_id() {
        let err = VaultConfig::from_lookup(lookup_from(&[("VAULT_SECRET_ID", "s")])).unwrap_err();
        assert_eq!(err, ConfigError::MissingRequired("VAULT_ROLE_ID".to_string()));
    }

    #[test]
    fn test_invalid_values() {
        let base = [("VAULT_ROLE_ID", "r"), ("VAULT_SECRET_ID", "s")];

        let mut pairs = base.to_vec();
        pairs.push(("VAULT_ADDR", "not a url"));
        assert!(matches!(
            VaultConfig::from_lookup(lookup_from(&pairs)),
            Err(ConfigError::InvalidUrl { .. })
        ));

        let mut pairs = base.to_vec();
        pairs.push(("VAULT_DEBUG", "maybe"));
        assert!(matches!(
            VaultConfig::from_lookup(lookup_from(&pairs)),
            Err(ConfigError::ParseError { .. })
        ));

        let mut pairs = base.to_vec();
        pairs.push(("VAULT_MIN_TTL_FRACTION", "1.5"));
        assert!(matches!(
            VaultConfig::from_lookup(lookup_from(&pairs)),
            Err(ConfigError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_policy_validation() {
        assert!(RenewalPolicy::default().validate().is_ok());
        assert!(RenewalPolicy::default().with_min_ttl_fraction(0.0).validate().is_err());
        assert!(RenewalPolicy::default().with_forbidden_ceiling(0).validate().is_err());
        assert!(
            RenewalPolicy::default()
                .with_backoff(Duration::from_secs(10), Duration::from_secs(1))
                .validate()
                .is_err()
        );
    }
}
