//! Spool worker behavior: descriptor lifecycle and per-target ordering.

mod common;

use std::path::Path;
use std::time::Duration;

use serde_json::json;

use common::{mock_connect, test_services_with_config, MockState};
use sluice_core::config::EngineConfig;
use sluice_core::spool::SpoolingManager;

fn check_flow() -> serde_json::Value {
    json!({
        "ENTRY": "M",
        "MODULE": {
            "M": { "ACTION": "CHECK", "CONNECT": mock_connect(), "TARGET": "X" },
        },
    })
}

fn write_descriptor(folder: &Path, flow_id: &str, target: &str, mark: &str) {
    std::fs::create_dir_all(folder).unwrap();
    let descriptor = json!({
        "target": target,
        "context": { "MARK": mark },
    });
    std::fs::write(
        folder.join(flow_id),
        serde_json::to_vec_pretty(&descriptor).unwrap(),
    )
    .unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within two seconds");
}

#[tokio::test]
async fn jobs_for_one_target_run_in_enqueue_order() {
    let dir = tempfile::tempdir().unwrap();
    let state = MockState::with_rows(0);
    *state.check_delay.lock() = Duration::from_millis(20);
    let config = EngineConfig {
        spool_folder: dir.path().join("spool"),
        payload_folder: dir.path().join("payload"),
        ..EngineConfig::default()
    };
    let (services, meta) = test_services_with_config(state.clone(), config);
    meta.insert_data("FLOW", "T1", check_flow());
    meta.insert_data("FLOW", "T2", check_flow());

    let spool_folder = dir.path().join("spool");
    write_descriptor(&spool_folder, "job-1", "T1", "T1-first");
    write_descriptor(&spool_folder, "job-2", "T1", "T1-second");
    write_descriptor(&spool_folder, "job-3", "T2", "T2-only");

    let spooler = SpoolingManager::start(services);
    spooler.enqueue("job-1".to_string());
    spooler.enqueue("job-2".to_string());
    spooler.enqueue("job-3".to_string());

    wait_until(|| state.checks.lock().len() == 3).await;

    let checks = state.checks.lock().clone();
    let first = checks.iter().position(|m| m == "T1-first").unwrap();
    let second = checks.iter().position(|m| m == "T1-second").unwrap();
    assert!(first < second, "same-target jobs ran out of order: {checks:?}");

    // successful jobs clean their descriptors up
    wait_until(|| {
        !spool_folder.join("job-1").exists()
            && !spool_folder.join("job-2").exists()
            && !spool_folder.join("job-3").exists()
    })
    .await;
}

#[tokio::test]
async fn failed_job_keeps_its_descriptor_for_replay() {
    let dir = tempfile::tempdir().unwrap();
    let state = MockState::with_rows(0);
    let config = EngineConfig {
        spool_folder: dir.path().join("spool"),
        payload_folder: dir.path().join("payload"),
        ..EngineConfig::default()
    };
    // no flow definition for T_MISSING
    let (services, _meta) = test_services_with_config(state, config);

    let spool_folder = dir.path().join("spool");
    write_descriptor(&spool_folder, "job-x", "T_MISSING", "never");

    let spooler = SpoolingManager::start(services);
    spooler.enqueue("job-x".to_string());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(spool_folder.join("job-x").exists());
}

#[tokio::test]
async fn payload_backup_is_replayed_into_the_flow() {
    let dir = tempfile::tempdir().unwrap();
    let state = MockState::with_rows(0);
    let config = EngineConfig {
        spool_folder: dir.path().join("spool"),
        payload_folder: dir.path().join("payload"),
        ..EngineConfig::default()
    };
    let (services, meta) = test_services_with_config(state.clone(), config);

    // the flow writes whatever arrives on its stream through the mock
    meta.insert_data(
        "FLOW",
        "T1",
        json!({
            "ENTRY": "DST",
            "MODULE": {
                "DST": { "ACTION": "CREATE", "CONNECT": mock_connect(), "BATCHSIZE": 2, "TARGET": "OUT" },
            },
        }),
    );

    let payload_folder = dir.path().join("payload");
    std::fs::create_dir_all(&payload_folder).unwrap();
    std::fs::write(
        payload_folder.join("ch-7"),
        serde_json::to_vec_pretty(&json!({
            "HEADER": null,
            "ITEMS": [{ "A": 1 }, { "A": 2 }, { "A": 3 }],
        }))
        .unwrap(),
    )
    .unwrap();

    let spool_folder = dir.path().join("spool");
    std::fs::create_dir_all(&spool_folder).unwrap();
    std::fs::write(
        spool_folder.join("job-p"),
        serde_json::to_vec_pretty(&json!({
            "target": "T1",
            "context": { "CHANNEL_ID": "ch-7" },
        }))
        .unwrap(),
    )
    .unwrap();

    let spooler = SpoolingManager::start(services);
    spooler.enqueue("job-p".to_string());

    wait_until(|| state.created_batches.lock().iter().sum::<usize>() == 3).await;
    assert_eq!(*state.created_batches.lock(), vec![2, 1]);
}
