//! Scheduler driving a real file sink whose reload command can fail.

#![cfg(unix)]

mod common;

use common::{MockLeases, MockTokens, PATH, exact_policy, lease_id};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use vault_renewal::{AtomicFileSink, CycleOutcome, RenewalScheduler, SinkFormat};

fn file_username(file: &Path) -> String {
    let parsed: serde_json::Value = serde_json::from_str(&fs::read_to_string(file).unwrap()).unwrap();
    parsed["username"].as_str().unwrap().to_string()
}

fn current(scheduler: &RenewalScheduler) -> Option<String> {
    scheduler
        .tracker()
        .lock()
        .current()
        .map(|c| c.lease_id.clone())
}

#[tokio::test]
async fn test_reload_failure_keeps_current_credentials_in_file() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("db.json");
    let fail = dir.path().join("fail");
    let sink = AtomicFileSink::new(&target, SinkFormat::Json).with_reload_command(vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("test ! -e '{}'", fail.display()),
    ]);

    let leases = MockLeases::new(Duration::from_secs(3600));
    let mut scheduler = RenewalScheduler::new(
        PATH,
        MockTokens::new(),
        leases.clone(),
        Arc::new(sink),
        exact_policy(),
    );
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

    assert!(matches!(
        scheduler.run_cycle(&mut shutdown_rx).await,
        CycleOutcome::Renewed { .. }
    ));
    assert_eq!(file_username(&target), "v-approle-1");

    fs::write(&fail, "").unwrap();
    assert!(matches!(
        scheduler.run_cycle(&mut shutdown_rx).await,
        CycleOutcome::Failed { .. }
    ));

    assert_eq!(current(&scheduler), Some(lease_id(1)));
    assert_eq!(leases.revoked(), vec![lease_id(2)]);
    assert_eq!(file_username(&target), "v-approle-1");

    fs::remove_file(&fail).unwrap();
    assert!(matches!(
        scheduler.run_cycle(&mut shutdown_rx).await,
        CycleOutcome::Renewed { .. }
    ));
    assert_eq!(current(&scheduler), Some(lease_id(3)));
    assert_eq!(file_username(&target), "v-approle-3");
    assert_eq!(leases.revoked(), vec![lease_id(2), lease_id(1)]);
}
