//! Property-based tests for rust-common crate.
//!
//! These tests verify universal properties across all inputs using proptest.

use proptest::prelude::*;
use rust_common::{PlatformError, RetryConfig, RetryPolicy, Retryable};
use std::time::Duration;

fn arb_policy() -> impl Strategy<Value = (RetryPolicy, Duration, Duration, Duration)> {
    (1u64..5_000, 1u64..600_000, 0u64..10_000).prop_map(|(initial, max, jitter)| {
        let initial = Duration::from_millis(initial);
        let max = Duration::from_millis(max).max(initial);
        let jitter = Duration::from_millis(jitter);
        let policy = RetryPolicy::new(
            RetryConfig::default()
                .with_initial_delay(initial)
                .with_max_delay(max)
                .with_jitter(jitter),
        );
        (policy, initial, max, jitter)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Backoff without jitter never decreases from one attempt to the next
    /// and never exceeds the configured cap.
    #[test]
    fn prop_base_delay_monotonic_and_capped(
        (policy, _initial, max, _jitter) in arb_policy(),
        attempt in 0u32..80,
    ) {
        let current = policy.base_delay_for_attempt(attempt);
        let next = policy.base_delay_for_attempt(attempt + 1);

        prop_assert!(next >= current);
        prop_assert!(current <= max);
    }

    /// Jittered delay always lies in `[base, base + jitter]`.
    #[test]
    fn prop_jitter_bounded(
        (policy, _initial, _max, jitter) in arb_policy(),
        attempt in 0u32..80,
    ) {
        let base = policy.base_delay_for_attempt(attempt);
        let delay = policy.delay_for_attempt(attempt);

        prop_assert!(delay >= base);
        prop_assert!(delay <= base + jitter);
    }

    #[test]
    fn prop_retryable_errors_are_consistent(msg in "[a-zA-Z0-9 ]{1,50}") {
        let retryable = [
            PlatformError::Unavailable(msg.clone()),
            PlatformError::Timeout(msg.clone()),
        ];
        for err in &retryable {
            prop_assert!(Retryable::is_retryable(err), "{:?} should be retryable", err);
        }

        let permanent = [
            PlatformError::InvalidInput(msg.clone()),
            PlatformError::Internal(msg),
        ];
        for err in &permanent {
            prop_assert!(!Retryable::is_retryable(err), "{:?} should not be retryable", err);
        }
    }
}
