//! Credential renewer service.
//!
//! Keeps a dynamic database credential from Vault renewed and written to a
//! file, reloading the consumer after every change.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod shutdown;

pub use config::ServiceConfig;
pub use shutdown::{ProcessSignal, SignalListener, run_until_shutdown};
