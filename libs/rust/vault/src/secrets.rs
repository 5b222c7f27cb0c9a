//! Secret-bearing types and Vault wire formats.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// A credential field map, e.g. `username`/`password`.
///
/// Values are held as [`SecretString`]; `Debug` prints field names only.
#[derive(Clone, Default)]
pub struct CredentialSet {
    fields: BTreeMap<String, SecretString>,
}

impl CredentialSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields
            .insert(key.into(), SecretString::from(value.into()));
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Expose a single field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(|v| v.expose_secret())
    }

    /// Field names in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Iterate over exposed `(field, value)` pairs in sorted order.
    pub fn expose_iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.expose_secret()))
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the set has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl PartialEq for CredentialSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.expose_iter().eq(other.expose_iter())
    }
}

impl Eq for CredentialSet {}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.fields.keys().map(|k| (k, "[REDACTED]")))
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for CredentialSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

/// Vault auth login response.
#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    /// Missing on error bodies
    #[serde(default)]
    pub auth: Option<AuthData>,
}

/// `auth` block of a login response.
#[derive(Deserialize)]
pub struct AuthData {
    /// Issued token; wrapped in a secret as soon as it is read
    #[serde(default)]
    pub client_token: Option<String>,
    /// Token TTL in seconds; 0 for non-expiring tokens, `None` if absent
    #[serde(default)]
    pub lease_duration: Option<u64>,
    /// Whether the token may be renewed
    #[serde(default)]
    pub renewable: bool,
    /// Attached policies
    #[serde(default)]
    pub policies: Vec<String>,
}

impl fmt::Debug for AuthData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthData")
            .field("client_token", &"[REDACTED]")
            .field("lease_duration", &self.lease_duration)
            .field("renewable", &self.renewable)
            .field("policies", &self.policies)
            .finish()
    }
}

/// Dynamic secret engine response, e.g. `database/creds/<role>`.
///
/// Every field is optional so that a missing one can be reported by name.
#[derive(Deserialize)]
pub struct DynamicCredsResponse {
    /// Credential fields
    #[serde(default)]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
    /// Lease id
    #[serde(default)]
    pub lease_id: Option<String>,
    /// Lease TTL in seconds
    #[serde(default)]
    pub lease_duration: Option<u64>,
    /// Whether the lease may be renewed
    #[serde(default)]
    pub renewable: bool,
}

/// `sys/leases/lookup` response.
#[derive(Debug, Deserialize)]
pub struct LeaseLookupResponse {
    /// Lookup payload
    #[serde(default)]
    pub data: Option<LeaseLookupData>,
}

/// `data` block of a lease lookup response.
#[derive(Debug, Deserialize)]
pub struct LeaseLookupData {
    /// Lease id
    pub id: String,
    /// Remaining TTL in seconds
    pub ttl: u64,
    /// Whether the lease may be renewed
    #[serde(default)]
    pub renewable: bool,
    /// RFC 3339 expiry
    #[serde(default)]
    pub expire_time: Option<String>,
    /// RFC 3339 issue time
    #[serde(default)]
    pub issue_time: Option<String>,
}

/// Render a JSON value as the string handed to the sink.
///
/// Strings pass through unquoted; everything else is serialized JSON.
pub(crate) fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
