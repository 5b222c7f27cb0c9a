//! Shared library for cross-cutting concerns in credential-renewer crates.
//!
//! This crate provides centralized implementations for:
//! - Error types with retryability classification
//! - HTTP client configuration and building
//! - Retry policies with exponential backoff and jitter
//! - Tracing subscriber initialisation
//! - Prometheus text metrics helpers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod http;
pub mod metrics;
pub mod retry;
pub mod tracing_config;

pub use error::{PlatformError, Retryable};
pub use http::{HttpConfig, build_http_client};
pub use metrics::{Counter, Gauge, PrometheusMetric, render_all};
pub use retry::{RetryConfig, RetryPolicy};
pub use tracing_config::{TracingConfig, init_tracing};
