//! Dynamic credential renewal for HashiCorp Vault leases.
//!
//! An AppRole [`AuthClient`] obtains tokens, a [`CredentialFetcher`] issues
//! dynamic credentials, a [`LeaseTracker`] keeps exactly one lease current
//! per path, and a [`RenewalScheduler`] replaces that lease before it runs
//! out, committing every new credential set to a [`ConfigSink`].

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod lease;
pub mod metrics;
pub mod provider;
pub mod scheduler;
pub mod secrets;
pub mod sink;
pub mod tracker;

pub use auth::{AuthClient, AuthToken};
pub use config::{RenewalPolicy, VaultConfig};
pub use engine::{RenewalEngine, RenewalHandle};
pub use error::{AuthError, CommitError, ConfigError, EngineError, FetchError, RevokeError, TrackerError};
pub use fetcher::CredentialFetcher;
pub use lease::{CredentialLease, LeaseInfo, LeaseState};
pub use metrics::RenewalMetrics;
pub use provider::{LeaseSource, TokenSource};
pub use scheduler::{CycleOutcome, RenewalScheduler, RenewalStatus, SchedulerState};
pub use secrets::CredentialSet;
pub use sink::{Ack, AtomicFileSink, ConfigSink, SinkFormat};
pub use tracker::LeaseTracker;
