//! Renewal metrics, shared by every scheduler of an engine.

use rust_common::{Counter, Gauge, render_all};

/// Counters and gauges describing renewal activity.
#[derive(Debug)]
pub struct RenewalMetrics {
    /// Successful renewal cycles
    pub renewals: Counter,
    /// Failed renewal cycles
    pub failures: Counter,
    /// Leases revoked in the store
    pub revocations: Counter,
    /// Revocations given up on
    pub revocation_failures: Counter,
    /// Credential paths currently stalled
    pub stalled: Gauge,
}

impl RenewalMetrics {
    /// Create zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self {
            renewals: Counter::new(
                "vault_renewal_renewals_total",
                "Successful credential renewals",
            ),
            failures: Counter::new(
                "vault_renewal_failures_total",
                "Failed credential renewal cycles",
            ),
            revocations: Counter::new(
                "vault_renewal_revocations_total",
                "Leases revoked in the secret store",
            ),
            revocation_failures: Counter::new(
                "vault_renewal_revocation_failures_total",
                "Lease revocations that could not be completed",
            ),
            stalled: Gauge::new(
                "vault_renewal_stalled_paths",
                "Credential paths stalled on repeated permission failures",
            ),
        }
    }

    /// Prometheus exposition text.
    #[must_use]
    pub fn render(&self) -> String {
        render_all(&[
            &self.renewals,
            &self.failures,
            &self.revocations,
            &self.revocation_failures,
            &self.stalled,
        ])
    }
}

impl Default for RenewalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_every_metric() {
        let metrics = RenewalMetrics::new();
        metrics.renewals.inc();
        metrics.stalled.inc();

        let text = metrics.render();
        assert!(text.contains("vault_renewal_renewals_total 1"));
        assert!(text.contains("vault_renewal_failures_total 0"));
        assert!(text.contains("vault_renewal_revocation_failures_total 0"));
        assert!(text.contains("# TYPE vault_renewal_stalled_paths gauge"));
        assert!(text.contains("vault_renewal_stalled_paths 1"));
    }
}
