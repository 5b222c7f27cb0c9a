//! Property-based tests for lease tracking and renewal timing.
//!
//! Tests validate:
//! - At most one live lease per path under any operation sequence
//! - Renewal timing is monotone and due at `(1 - fraction) * ttl`
//! - Secret values never appear in debug output

use proptest::prelude::*;
use std::time::Duration;
use vault_renewal::lease::time_to_renew_at;
use vault_renewal::{AuthToken, CredentialLease, CredentialSet, LeaseState, LeaseTracker, RenewalPolicy};

#[derive(Debug, Clone)]
enum Op {
    Begin,
    Record(u8),
    Supersede,
    SupersedeStale(u8),
    Rollback,
    Finish,
    ExpireCurrent,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Begin),
        (0u8..6).prop_map(Op::Record),
        Just(Op::Supersede),
        (0u8..6).prop_map(Op::SupersedeStale),
        Just(Op::Rollback),
        Just(Op::Finish),
        Just(Op::ExpireCurrent),
    ]
}

fn lease(id: &str) -> CredentialLease {
    CredentialLease::new(
        id,
        CredentialSet::new().with("username", id).with("password", "pw"),
        Duration::from_secs(3600),
        true,
    )
}

fn secret_value_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z0-9!@#$%^&*]{12,64}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// *For any* sequence of tracker operations, at most one lease is live
    /// and a pending lease is never live.
    #[test]
    fn prop_single_live_lease(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let mut tracker = LeaseTracker::new("database/creds/app");

        for op in ops {
            let current = tracker.current().map(|c| c.lease_id.clone());
            let pending = tracker.pending().map(|p| p.lease_id.clone());
            match op {
                Op::Begin => { let _ = tracker.begin_renewal(); }
                Op::Record(n) => { let _ = tracker.record(lease(&format!("lease-{n}"))); }
                Op::Supersede => {
                    if let Some(new) = &pending {
                        let _ = tracker.supersede(current.as_deref(), new);
                    }
                }
                Op::SupersedeStale(n) => {
                    let stale = format!("lease-{n}");
                    if let Some(new) = &pending {
                        let before = current.clone();
                        if tracker.supersede(Some(&stale), new).is_err() {
                            prop_assert_eq!(tracker.current().map(|c| c.lease_id.clone()), before);
                        }
                    }
                }
                Op::Rollback => {
                    if let Some(new) = &pending {
                        let _ = tracker.rollback(new);
                        prop_assert_eq!(tracker.current().map(|c| c.lease_id.clone()), current);
                    }
                }
                Op::Finish => { let _ = tracker.finish_renewal(); }
                Op::ExpireCurrent => {
                    if let Some(id) = &current {
                        let _ = tracker.expire(id);
                    }
                }
            }

            prop_assert!(tracker.live_count() <= 1);
            if let Some(p) = tracker.pending() {
                prop_assert_eq!(p.state, LeaseState::Pending);
            }
            if let Some(c) = tracker.current() {
                prop_assert!(c.state.is_live());
            }
        }
    }

    /// *For any* TTL and fraction, time to renew never grows with elapsed
    /// time and reaches zero at `(1 - fraction) * ttl`.
    #[test]
    fn prop_time_to_renew_monotone(
        ttl_secs in 1u64..100_000,
        fraction_pct in 1u32..100,
        a in 0u64..200_000,
        b in 0u64..200_000,
    ) {
        let fraction = f64::from(fraction_pct) / 100.0;
        let policy = RenewalPolicy::default().with_min_ttl_fraction(fraction);
        let lease = CredentialLease::new("l", CredentialSet::new().with("k", "v"), Duration::from_secs(ttl_secs), true);
        let (early, late) = if a <= b { (a, b) } else { (b, a) };

        let at = |secs: u64| time_to_renew_at(&lease, &policy, lease.issued_at + Duration::from_secs(secs));
        prop_assert!(at(early) >= at(late));
        prop_assert!(at(0) <= lease.ttl);

        let due = lease.ttl.mul_f64(1.0 - fraction);
        prop_assert_eq!(time_to_renew_at(&lease, &policy, lease.issued_at + due + Duration::from_millis(1)), Duration::ZERO);
    }

    /// *For any* secret value, debug output of credential-bearing types
    /// shows field names and lease ids but never the value.
    #[test]
    fn prop_secrets_not_exposed_in_debug(
        password in secret_value_strategy(),
        lease_id in "[a-z]{4,8}/creds/[a-z0-9]{8}",
    ) {
        let creds = CredentialSet::new().with("password", password.clone());
        let lease = CredentialLease::new(lease_id.clone(), creds.clone(), Duration::from_secs(60), true);
        let token = AuthToken::new(password.clone(), Duration::from_secs(60), false);

        for debug in [format!("{creds:?}"), format!("{lease:?}"), format!("{token:?}")] {
            prop_assert!(!debug.contains(&password));
            prop_assert!(debug.contains("[REDACTED]"));
        }
        let lease_debug = format!("{lease:?}");
        prop_assert!(lease_debug.contains(&lease_id));
        prop_assert_eq!(creds.get("password"), Some(password.as_str()));
    }
}

#[test]
fn test_renewal_due_at_2700_of_3600() {
    let policy = RenewalPolicy::default();
    let lease = lease("l1");
    let due = lease.issued_at + Duration::from_secs(2700);

    assert_eq!(time_to_renew_at(&lease, &policy, lease.issued_at), Duration::from_secs(2700));
    assert_eq!(time_to_renew_at(&lease, &policy, due), Duration::ZERO);
    assert_eq!(lease.remaining_at(due), Duration::from_secs(900));
}
