//! Service configuration.
//!
//! Wraps [`VaultConfig`] and adds where credentials are written, how the
//! consumer is reloaded, and process-level settings.

use rust_common::TracingConfig;
use std::path::PathBuf;
use std::time::Duration;
use vault_renewal::config::{parse_flag, parse_secs, parse_var};
use vault_renewal::{AtomicFileSink, ConfigError, SinkFormat, VaultConfig};

const DEFAULT_SINK_PATH: &str = "./credentials.json";
const SERVICE_NAME: &str = "credential-renewer";

/// Service configuration with validation.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Store connection and renewal policy
    pub vault: VaultConfig,
    /// File the credential set is written to
    pub sink_path: PathBuf,
    /// On-disk format of that file
    pub sink_format: SinkFormat,
    /// Command run after every applied write
    pub reload_command: Option<Vec<String>>,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Emit JSON log lines
    pub log_json: bool,
}

impl ServiceConfig {
    /// Loads configuration from the environment, honouring a `.env` file.
    ///
    /// # Errors
    ///
    /// See [`ServiceConfig::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found in the store settings or the
    /// service settings.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vault = VaultConfig::from_lookup(&lookup)?;

        let sink_path = lookup("RENEWER_SINK_PATH")
            .filter(|v| !v.trim().is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_SINK_PATH), PathBuf::from);
        let sink_format = parse_var(&lookup, "RENEWER_SINK_FORMAT", SinkFormat::Json)?;
        let reload_command = lookup("RENEWER_RELOAD_COMMAND")
            .map(|v| v.split_whitespace().map(str::to_string).collect::<Vec<_>>())
            .filter(|argv| !argv.is_empty());

        let config = Self {
            vault,
            sink_path,
            sink_format,
            reload_command,
            shutdown_timeout: parse_secs(&lookup, "SHUTDOWN_TIMEOUT", Duration::from_secs(30))?,
            log_json: parse_flag(&lookup, "LOG_JSON", false)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::ParseError {
                name: "SHUTDOWN_TIMEOUT".to_string(),
                reason: "timeout must be greater than 0".to_string(),
            });
        }
        if self.sink_path.file_name().is_none() {
            return Err(ConfigError::ParseError {
                name: "RENEWER_SINK_PATH".to_string(),
                reason: "path must name a file".to_string(),
            });
        }
        Ok(())
    }

    /// Tracing settings: `debug` level when the store's debug flag is set.
    #[must_use]
    pub fn tracing(&self) -> TracingConfig {
        let level = if self.vault.debug { "debug" } else { "info" };
        TracingConfig::default()
            .with_service_name(SERVICE_NAME)
            .with_log_level(level)
            .with_json_output(self.log_json)
    }

    /// The file sink described by this configuration.
    #[must_use]
    pub fn sink(&self) -> AtomicFileSink {
        let sink = AtomicFileSink::new(&self.sink_path, self.sink_format);
        match &self.reload_command {
            Some(argv) => sink.with_reload_command(argv.clone()),
            None => sink,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [("VAULT_ROLE_ID", "role"), ("VAULT_SECRET_ID", "secret")];

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::from_lookup(lookup_from(&REQUIRED)).unwrap();

        assert_eq!(config.sink_path, PathBuf::from("./credentials.json"));
        assert_eq!(config.sink_format, SinkFormat::Json);
        assert!(config.reload_command.is_none());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert!(!config.log_json);
        assert_eq!(config.tracing().log_level, "debug");
    }

    #[test]
    fn test_service_variables() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("RENEWER_SINK_PATH", "/run/app/db.env"),
            ("RENEWER_SINK_FORMAT", "env"),
            ("RENEWER_RELOAD_COMMAND", "systemctl  reload php-fpm"),
            ("SHUTDOWN_TIMEOUT", "5"),
            ("LOG_JSON", "true"),
            ("VAULT_DEBUG", "false"),
        ]);
        let config = ServiceConfig::from_lookup(lookup_from(&pairs)).unwrap();

        assert_eq!(config.sink_path, PathBuf::from("/run/app/db.env"));
        assert_eq!(config.sink_format, SinkFormat::Env);
        assert_eq!(
            config.reload_command,
            Some(vec!["systemctl".to_string(), "reload".to_string(), "php-fpm".to_string()])
        );
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert!(config.tracing().json_output);
        assert_eq!(config.tracing().log_level, "info");
        assert_eq!(config.sink().path(), config.sink_path.as_path());
    }

    #[test]
    fn test_invalid_values() {
        for (name, value) in [
            ("RENEWER_SINK_FORMAT", "yaml"),
            ("SHUTDOWN_TIMEOUT", "0"),
            ("SHUTDOWN_TIMEOUT", "soon"),
            ("LOG_JSON", "maybe"),
            ("RENEWER_SINK_PATH", "/"),
        ] {
            let mut pairs = REQUIRED.to_vec();
            pairs.push((name, value));
            let err = ServiceConfig::from_lookup(lookup_from(&pairs)).unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { .. }), "{name}={value}: {err:?}");
        }
    }

    #[test]
    fn test_missing_role_is_reported() {
        let err = ServiceConfig::from_lookup(lookup_from(&[("VAULT_SECRET_ID", "s")])).unwrap_err();
        assert_eq!(err, ConfigError::MissingRequired("VAULT_ROLE_ID".to_string()));
    }
}
