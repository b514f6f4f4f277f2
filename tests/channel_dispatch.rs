//! Channel fan-out: per-target results, aggregate failure, payload backup
//! and the spooled fast path.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{mock_connect, test_services, test_services_with_config, MockState};
use sluice_core::channel::ChannelAgent;
use sluice_core::config::EngineConfig;
use sluice_core::constants::context_keys;
use sluice_core::spool::SpoolingManager;
use sluice_core::stream::InputStream;

fn check_flow() -> serde_json::Value {
    json!({
        "ENTRY": "M",
        "MODULE": {
            "M": { "ACTION": "CHECK", "CONNECT": mock_connect(), "TARGET": "X" },
        },
    })
}

fn create_flow() -> serde_json::Value {
    json!({
        "ENTRY": "M",
        "MODULE": {
            "M": { "ACTION": "CREATE", "CONNECT": mock_connect(), "BATCHSIZE": 2, "TARGET": "OUT" },
        },
    })
}

fn body_with_items(n: usize) -> serde_json::Value {
    let items: Vec<_> = (0..n).map(|i| json!({ "N": i })).collect();
    json!({ "HEADER": null, "ITEMS": items })
}

#[tokio::test]
async fn one_failing_target_fails_the_aggregate_but_not_its_siblings() {
    let state = MockState::with_rows(0);
    let (services, meta) = test_services(state.clone());
    meta.insert_data("FLOW", "T_OK", check_flow());
    // T_BAD has no flow definition
    meta.insert_data("API", "orders", json!({ "TARGET": { "G": ["T_OK", "T_BAD"] } }));

    let spooler = SpoolingManager::start(services.clone());
    let mut agent = ChannelAgent::new(services, spooler);
    let response = agent.process(None, "orders").await.unwrap();

    let results = &response["result"];
    assert_eq!(results["T_OK"]["result"], json!("success"));
    assert_eq!(results["T_BAD"]["result"], json!("fail"));
    assert_eq!(
        agent.context().get_string(context_keys::LATEST_RESULT).as_deref(),
        Some("fail")
    );
    // the healthy sibling still ran its check
    assert_eq!(state.checks.lock().len(), 1);
}

#[tokio::test]
async fn all_green_targets_yield_an_aggregate_success() {
    let state = MockState::with_rows(0);
    let (services, meta) = test_services(state);
    meta.insert_data("FLOW", "T1", check_flow());
    meta.insert_data("FLOW", "T2", check_flow());
    meta.insert_data("API", "orders", json!({ "TARGET": { "G": ["T1", "T2"] } }));

    let spooler = SpoolingManager::start(services.clone());
    let mut agent = ChannelAgent::new(services, spooler);
    let response = agent.process(None, "orders").await.unwrap();

    assert_eq!(response["result"]["T1"]["result"], json!("success"));
    assert_eq!(response["result"]["T2"]["result"], json!("success"));
    assert_eq!(
        agent.context().get_string(context_keys::LATEST_RESULT).as_deref(),
        Some("success")
    );
}

#[tokio::test]
async fn concurrent_dispatch_reports_every_target() {
    let state = MockState::with_rows(0);
    let (services, meta) = test_services(state.clone());
    meta.insert_data("FLOW", "T1", check_flow());
    meta.insert_data("FLOW", "T2", check_flow());
    meta.insert_data(
        "API",
        "orders",
        json!({
            "TARGET": { "G": ["T1", "T2"] },
            "CONCURRENCY": { "ENABLE": true },
        }),
    );

    let spooler = SpoolingManager::start(services.clone());
    let mut agent = ChannelAgent::new(services, spooler);
    let response = agent.process(None, "orders").await.unwrap();

    assert_eq!(response["result"].as_object().unwrap().len(), 2);
    assert_eq!(state.checks.lock().len(), 2);
}

#[tokio::test]
async fn every_target_receives_the_whole_request_body() {
    let state = MockState::with_rows(0);
    let (services, meta) = test_services(state.clone());
    meta.insert_data("FLOW", "T1", create_flow());
    meta.insert_data("FLOW", "T2", create_flow());
    meta.insert_data("API", "orders", json!({ "TARGET": { "G": ["T1", "T2"] } }));

    let spooler = SpoolingManager::start(services.clone());
    let mut agent = ChannelAgent::new(services, spooler);
    agent.add_context(context_keys::REQUEST_BODY, body_with_items(3));
    let response = agent.process(None, "orders").await.unwrap();

    assert_eq!(response["result"]["T1"]["result"], json!("success"));
    assert_eq!(response["result"]["T2"]["result"], json!("success"));
    // 3 rows per target, pushed as 2 + 1 each
    let batches = state.created_batches.lock().clone();
    assert_eq!(batches.iter().sum::<usize>(), 6);
}

#[tokio::test]
async fn concurrent_targets_each_drain_the_full_body() {
    let state = MockState::with_rows(0);
    let (services, meta) = test_services(state.clone());
    meta.insert_data("FLOW", "T1", create_flow());
    meta.insert_data("FLOW", "T2", create_flow());
    meta.insert_data(
        "API",
        "orders",
        json!({
            "TARGET": { "G": ["T1", "T2"] },
            "CONCURRENCY": { "ENABLE": true },
        }),
    );

    let spooler = SpoolingManager::start(services.clone());
    let mut agent = ChannelAgent::new(services, spooler);
    agent.add_context(context_keys::REQUEST_BODY, body_with_items(4));
    let response = agent.process(None, "orders").await.unwrap();

    assert_eq!(response["result"]["T1"]["result"], json!("success"));
    assert_eq!(response["result"]["T2"]["result"], json!("success"));
    assert_eq!(state.created_batches.lock().iter().sum::<usize>(), 8);
}

#[tokio::test]
async fn payload_backup_lands_under_the_channel_id() {
    let dir = tempfile::tempdir().unwrap();
    let state = MockState::with_rows(0);
    let config = EngineConfig {
        payload_folder: dir.path().join("payload"),
        spool_folder: dir.path().join("spool"),
        ..EngineConfig::default()
    };
    let (services, meta) = test_services_with_config(state, config);
    meta.insert_data("FLOW", "T1", check_flow());
    meta.insert_data(
        "API",
        "orders",
        json!({ "TARGET": { "G": ["T1"] }, "BACKUP_PAYLOAD": true }),
    );

    let spooler = SpoolingManager::start(services.clone());
    let mut agent = ChannelAgent::new(services, spooler);
    agent.add_context(context_keys::CHANNEL_ID, json!("ch-42"));

    let stream = Arc::new(InputStream::single(json!({
        "HEADER": null,
        "ITEMS": [{ "A": 1 }],
    })));
    agent.process(Some(stream), "orders").await.unwrap();

    let backup = dir.path().join("payload").join("ch-42");
    let doc: serde_json::Value =
        serde_json::from_slice(&std::fs::read(backup).unwrap()).unwrap();
    assert_eq!(doc["ITEMS"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn spooling_flow_answers_immediately_with_a_job_id() {
    let dir = tempfile::tempdir().unwrap();
    let state = MockState::with_rows(0);
    let config = EngineConfig {
        payload_folder: dir.path().join("payload"),
        spool_folder: dir.path().join("spool"),
        ..EngineConfig::default()
    };
    let (services, meta) = test_services_with_config(state, config);

    let mut flow = check_flow();
    flow["SPOOLING"] = json!(true);
    meta.insert_data("FLOW", "T1", flow);
    meta.insert_data("API", "orders", json!({ "TARGET": { "G": ["T1"] } }));

    let spooler = SpoolingManager::start(services.clone());
    let mut agent = ChannelAgent::new(services, spooler);
    let response = agent.process(None, "orders").await.unwrap();

    let entry = &response["result"]["T1"];
    assert_eq!(entry["result"], json!("spooled"));
    let job_id = entry["ID"].as_str().unwrap();
    assert!(!job_id.is_empty());
}

#[tokio::test]
async fn disabled_api_is_rejected() {
    let state = MockState::with_rows(0);
    let (services, meta) = test_services(state);
    meta.insert_data("API", "orders", json!({ "ENABLE": false }));

    let spooler = SpoolingManager::start(services.clone());
    let mut agent = ChannelAgent::new(services, spooler);
    assert!(agent.process(None, "orders").await.is_err());
}
